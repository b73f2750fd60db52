use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WavaError};

/// Operation encoded in a mailbox file name (`<id>-<operation>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Submit,
    Cancel,
    Jobs,
    Group,
    Exit,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Submit => "submit",
            Operation::Cancel => "cancel",
            Operation::Jobs => "jobs",
            Operation::Group => "group",
            Operation::Exit => "exit",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = WavaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "submit" => Ok(Operation::Submit),
            "cancel" => Ok(Operation::Cancel),
            "jobs" => Ok(Operation::Jobs),
            "group" => Ok(Operation::Group),
            "exit" => Ok(Operation::Exit),
            other => Err(WavaError::Protocol(format!("unknown operation: {other}"))),
        }
    }
}

/// Parsed mailbox file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestName {
    pub id: u64,
    pub op: Operation,
}

impl RequestName {
    pub fn new(id: u64, op: Operation) -> Self {
        Self { id, op }
    }

    /// Returns `None` for names that are not `<numeric-id>-<operation>`.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (id, op) = Self::split(file_name)?;
        Some(Self {
            id,
            op: op.parse().ok()?,
        })
    }

    /// Split `<numeric-id>-<rest>` without judging the operation.
    pub fn split(file_name: &str) -> Option<(u64, &str)> {
        let (id, op) = file_name.split_once('-')?;
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some((id.parse().ok()?, op))
    }

    pub fn file_name(&self) -> String {
        format!("{}-{}", self.id, self.op)
    }
}

/// Body of a `submit` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub command: Vec<String>,
    /// Promised peak resident memory, in bytes.
    pub max_rss: u64,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub parent_id: Option<u64>,
    #[serde(default)]
    pub idempotent: bool,
}

impl JobRequest {
    pub fn new(command: Vec<String>, max_rss: u64, working_directory: PathBuf) -> Self {
        Self {
            command,
            max_rss,
            working_directory,
            environment: HashMap::new(),
            group: None,
            parent_id: None,
            idempotent: false,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_parent(mut self, parent_id: u64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub id: u64,
}

/// Body of a `group` request. Without `delete` or `list` it creates the
/// group, or updates it when it already exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub time_to_idle: Option<i64>,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub list: bool,
    #[serde(default)]
    pub no_headers: bool,
}

/// A fully decoded mailbox request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Submit(JobRequest),
    Cancel(CancelRequest),
    Jobs { no_headers: bool },
    Group(GroupRequest),
    Exit,
}

impl Request {
    pub fn operation(&self) -> Operation {
        match self {
            Request::Submit(_) => Operation::Submit,
            Request::Cancel(_) => Operation::Cancel,
            Request::Jobs { .. } => Operation::Jobs,
            Request::Group(_) => Operation::Group,
            Request::Exit => Operation::Exit,
        }
    }

    pub fn decode(op: Operation, body: &str) -> Result<Self> {
        let body = body.trim();
        match op {
            Operation::Submit => {
                let request: JobRequest = serde_json::from_str(body)?;
                if request.command.is_empty() {
                    return Err(WavaError::Protocol("empty command".into()));
                }
                Ok(Request::Submit(request))
            }
            Operation::Cancel => Ok(Request::Cancel(serde_json::from_str(body)?)),
            Operation::Jobs => {
                let no_headers = if body.is_empty() {
                    false
                } else {
                    serde_json::from_str(body)?
                };
                Ok(Request::Jobs { no_headers })
            }
            Operation::Group => Ok(Request::Group(serde_json::from_str(body)?)),
            Operation::Exit => Ok(Request::Exit),
        }
    }

    pub fn encode(&self) -> Result<String> {
        let body = match self {
            Request::Submit(request) => serde_json::to_string(request)?,
            Request::Cancel(request) => serde_json::to_string(request)?,
            Request::Jobs { no_headers } => serde_json::to_string(no_headers)?,
            Request::Group(request) => serde_json::to_string(request)?,
            Request::Exit => serde_json::to_string("exit")?,
        };
        Ok(body)
    }
}
