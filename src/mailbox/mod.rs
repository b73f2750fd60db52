//! Request intake.
//!
//! Clients publish one file per request in `$WAVA_HOME/mailbox`, named
//! `<id>-<operation>`, after creating the FIFOs of their channel under
//! `$WAVA_HOME/streams/<id>`. [`MailboxWatcher`] reports arrivals and
//! [`RequestHandler`] claims each file and dispatches it to the scheduler.

pub mod handler;
pub mod watcher;

pub use handler::{Envelope, RequestHandler};
pub use watcher::MailboxWatcher;
