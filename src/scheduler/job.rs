use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::peer::PeerChannel;
use crate::protocol::JobRequest;

/// A submitted job and its scheduling bookkeeping.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: u64,
    pub request: JobRequest,
    /// Group the job was filed under (the default group when the request
    /// named none).
    pub group: String,
    pub user: u32,
    pub peer: Arc<PeerChannel>,
    pub submitted_at: DateTime<Utc>,
    /// Last queue position reported to the peer.
    pub previous_position: Option<usize>,
    pub queued_children: usize,
    pub running_children: usize,
    /// Set once the job was killed to break a starvation deadlock and will
    /// re-enter the queue when its process exits.
    pub relaunched: bool,
}

impl Job {
    pub fn new(id: u64, request: JobRequest, group: String, user: u32, peer: Arc<PeerChannel>) -> Self {
        Self {
            id,
            request,
            group,
            user,
            peer,
            submitted_at: Utc::now(),
            previous_position: None,
            queued_children: 0,
            running_children: 0,
            relaunched: false,
        }
    }

    /// Waiting on sub-jobs that cannot be admitted.
    pub fn is_blocked(&self) -> bool {
        self.queued_children > 0 && self.running_children == 0
    }
}

/// Why the scheduler is tearing a running job down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    Cancelled,
    PromiseExceeded,
    Starvation,
    StalePeer,
    Shutdown,
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillReason::Cancelled => write!(f, "cancelled"),
            KillReason::PromiseExceeded => write!(f, "promise exceeded"),
            KillReason::Starvation => write!(f, "starvation"),
            KillReason::StalePeer => write!(f, "stale peer"),
            KillReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// A running job's OS process.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub job_id: u64,
    /// `None` until the worker task has spawned the process.
    pub pid: Option<u32>,
    /// Current promise; raised when an overrun is tolerated.
    pub promised_rss: u64,
    pub max_seen_rss: u64,
    pub cpu_time_ms: u64,
    pub niceness: Option<i32>,
    /// True once at least one overrun has been tolerated.
    pub allowed: bool,
    pub killing: Option<KillReason>,
    pub started_at: Instant,
}

impl ProcessInfo {
    pub fn new(job_id: u64, promised_rss: u64) -> Self {
        Self {
            job_id,
            pid: None,
            promised_rss,
            max_seen_rss: 0,
            cpu_time_ms: 0,
            niceness: None,
            allowed: false,
            killing: None,
            started_at: Instant::now(),
        }
    }
}

/// A scheduling group.
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub name: String,
    pub id: u64,
    pub owner: u32,
    pub priority: i32,
    /// Seconds an empty group survives; `-1` keeps it forever.
    pub time_to_idle: i64,
    pub jobs: BTreeSet<u64>,
    /// Created on first submission rather than by a `group` request.
    pub dynamic: bool,
    pub empty_since: Option<Instant>,
}

impl GroupInfo {
    pub fn new(name: String, id: u64, owner: u32, priority: i32, time_to_idle: i64, dynamic: bool) -> Self {
        Self {
            name,
            id,
            owner,
            priority,
            time_to_idle,
            jobs: BTreeSet::new(),
            dynamic,
            empty_since: Some(Instant::now()),
        }
    }

    pub fn is_eternal(&self) -> bool {
        self.time_to_idle < 0
    }
}
