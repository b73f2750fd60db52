//! Job process execution.
//!
//! - [`JobExecutor::spawn`] starts the job's argv in its own process group
//! - [`JobExecutor::supervise`] forwards stdout/stderr to the peer and waits
//!   for the exit status
//!
//! Only bookkeeping around these calls happens under the scheduler lock.

pub mod executor;

pub use executor::{ExecutionResult, JobExecutor, JOB_ID_ENV};
