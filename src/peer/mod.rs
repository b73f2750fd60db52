//! Per-request communication with the submitting peer.
//!
//! Each request owns three one-way byte streams (`events`, `stdout`,
//! `stderr`) backed by FIFOs under `streams/<id>/`. The daemon writes, the
//! peer reads. See [`PeerChannel`] for the liveness and orphan rules.

pub mod channel;

pub use channel::{PeerChannel, PeerStream, CONDUITS};
