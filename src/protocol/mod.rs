//! Wire formats shared by the daemon and its clients.
//!
//! - Mailbox file names `<id>-<operation>` and their JSON bodies ([`request`])
//! - Line-oriented events `<unixMillis>:<name>[:<json>]` ([`event`])

pub mod event;
pub mod request;

pub use event::{Event, EventRecord, RetCode};
pub use request::{CancelRequest, GroupRequest, JobRequest, Operation, Request, RequestName};
