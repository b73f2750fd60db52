pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod lock;
pub mod mailbox;
pub mod os;
pub mod peer;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod worker;
