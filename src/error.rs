use thiserror::Error;

use crate::protocol::RetCode;

#[derive(Error, Debug)]
pub enum WavaError {
    #[error("Job id already tracked: {0}")]
    DuplicateId(u64),

    #[error("Job {0} is not queued")]
    NotQueued(u64),

    #[error("Job not found: {0}")]
    JobNotFound(u64),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Group {name} still has {jobs} job(s)")]
    GroupNotEmpty { name: String, jobs: usize },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Scheduler is closed")]
    Closed,

    #[error("Malformed request: {0}")]
    Protocol(String),

    #[error("Peer never attached to channel {0}")]
    Orphaned(u64),

    #[error("Daemon already running (lock held on {0})")]
    AlreadyRunning(String),

    #[error("WAVA_HOME is not set")]
    HomeNotSet,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WavaError {
    /// Peer-visible return code for this error.
    pub fn ret_code(&self) -> RetCode {
        match self {
            WavaError::Closed => RetCode::CoreNotRunning,
            WavaError::PermissionDenied(_) => RetCode::NotRootUser,
            WavaError::HomeNotSet => RetCode::WavaHomeNotSet,
            _ => RetCode::Error,
        }
    }
}

pub type Result<T> = std::result::Result<T, WavaError>;
