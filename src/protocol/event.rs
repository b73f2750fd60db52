use serde_json::Value;

use crate::error::{Result, WavaError};

/// Return codes surfaced to peers in the terminal `retcode` event of
/// non-submit operations (a submitted job reports its process exit status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RetCode {
    Success = 0,
    Error = 1,
    Cancelled = 2,
    CoreNotRunning = 3,
    NotRootUser = 4,
    WavaHomeNotSet = 5,
}

impl RetCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(RetCode::Success),
            1 => Some(RetCode::Error),
            2 => Some(RetCode::Cancelled),
            3 => Some(RetCode::CoreNotRunning),
            4 => Some(RetCode::NotRootUser),
            5 => Some(RetCode::WavaHomeNotSet),
            _ => None,
        }
    }
}

impl std::fmt::Display for RetCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetCode::Success => write!(f, "SUCCESS"),
            RetCode::Error => write!(f, "ERROR"),
            RetCode::Cancelled => write!(f, "CANCELLED"),
            RetCode::CoreNotRunning => write!(f, "CORE_NOT_RUNNING"),
            RetCode::NotRootUser => write!(f, "NOT_ROOT_USER"),
            RetCode::WavaHomeNotSet => write!(f, "WAVA_HOME_NOT_SET"),
        }
    }
}

/// An event written by the daemon on a peer's events stream.
///
/// Memory-related payloads are byte counts.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Id(u64),
    Priority(i32),
    Queued(usize),
    Running,
    Niceness(i32),
    Cancelled,
    ExceedAllowed(u64),
    ExceedDisallowed(u64),
    ExceedGlobal(u64),
    ExceedTree(u64),
    StarvationRelaunch,
    DeadlockStop,
    Shutdown,
    MaxRss(u64),
    Error(String),
    Retcode(i32),
    Ping,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Id(_) => "id",
            Event::Priority(_) => "priority",
            Event::Queued(_) => "queued",
            Event::Running => "running",
            Event::Niceness(_) => "niceness",
            Event::Cancelled => "cancelled",
            Event::ExceedAllowed(_) => "exceed_allowed",
            Event::ExceedDisallowed(_) => "exceed_disallowed",
            Event::ExceedGlobal(_) => "exceed_global",
            Event::ExceedTree(_) => "exceed_tree",
            Event::StarvationRelaunch => "starvation_relaunch",
            Event::DeadlockStop => "deadlock_stop",
            Event::Shutdown => "shutdown",
            Event::MaxRss(_) => "maxrss",
            Event::Error(_) => "error",
            Event::Retcode(_) => "retcode",
            Event::Ping => "ping",
        }
    }

    pub fn value(&self) -> Option<Value> {
        match self {
            Event::Id(v) => Some(Value::from(*v)),
            Event::Priority(v) | Event::Niceness(v) | Event::Retcode(v) => Some(Value::from(*v)),
            Event::Queued(v) => Some(Value::from(*v)),
            Event::ExceedAllowed(v)
            | Event::ExceedDisallowed(v)
            | Event::ExceedGlobal(v)
            | Event::ExceedTree(v)
            | Event::MaxRss(v) => Some(Value::from(*v)),
            Event::Error(msg) => Some(Value::from(msg.as_str())),
            Event::Running
            | Event::Cancelled
            | Event::StarvationRelaunch
            | Event::DeadlockStop
            | Event::Shutdown
            | Event::Ping => None,
        }
    }

    /// Encode as one wire line: `<unixMillis>:<name>[:<json>]\n`.
    pub fn encode(&self, timestamp_ms: i64) -> String {
        match self.value() {
            Some(value) => format!("{}:{}:{}\n", timestamp_ms, self.name(), value),
            None => format!("{}:{}\n", timestamp_ms, self.name()),
        }
    }
}

/// A decoded event line as seen by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub timestamp_ms: i64,
    pub name: String,
    pub value: Option<Value>,
}

impl EventRecord {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\n', '\r']);
        let (timestamp, rest) = line
            .split_once(':')
            .ok_or_else(|| WavaError::Protocol(format!("event line without name: {line:?}")))?;
        let timestamp_ms = timestamp
            .parse::<i64>()
            .map_err(|e| WavaError::Protocol(format!("bad event timestamp {timestamp:?}: {e}")))?;

        let (name, value) = match rest.split_once(':') {
            Some((name, raw)) => (name, Some(serde_json::from_str(raw)?)),
            None => (rest, None),
        };
        if name.is_empty() {
            return Err(WavaError::Protocol(format!("empty event name: {line:?}")));
        }

        Ok(Self {
            timestamp_ms,
            name: name.to_string(),
            value,
        })
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.value.as_ref().and_then(Value::as_i64)
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.value.as_ref().and_then(Value::as_u64)
    }
}
