use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WavaError};

pub const DEFAULT_GROUP: &str = "default";
pub const HOME_ENV: &str = "WAVA_HOME";

/// How the scheduler reacts when a running job exceeds its promised RSS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromisePolicy {
    /// Any overrun kills the job.
    #[default]
    Strict,
    /// Overruns are tolerated (and the promise raised) unless the machine is
    /// out of budget and the job is above its per-job ceiling.
    Lax,
}

/// Scheduler tuning knobs.
///
/// Loaded from `$WAVA_HOME/etc/wava.json` when present; every field is
/// optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Memory ceiling treated as schedulable, in bytes.
    /// Total system memory (sampled once at startup) when unset.
    pub managed_memory: Option<u64>,
    pub refresh_interval_ms: u64,
    pub min_niceness: i32,
    pub max_niceness: i32,
    /// Fraction of managed capacity that blocked running jobs may hold
    /// before the queue is considered starving.
    pub max_blocked_rss_starvation_ratio: f64,
    pub promise_policy: PromisePolicy,
    /// Absolute per-job RSS ceiling, in bytes.
    pub max_job_rss: Option<u64>,
    /// Idle timeout for implicitly created groups (`-1` keeps them forever).
    pub dynamic_group_idle_secs: i64,
    /// How long a peer has to attach to its streams before the request is
    /// considered abandoned.
    pub peer_attach_timeout_ms: u64,
    pub peer_write_timeout_ms: u64,
    /// Delay between SIGTERM and the SIGKILL sweep.
    pub kill_grace_ms: u64,
    /// Use live (possibly raised) promises of running ancestors for the
    /// nested-job tree check instead of their declared promises.
    pub tree_check_live_promises: bool,
    pub require_root: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            managed_memory: None,
            refresh_interval_ms: 1000,
            min_niceness: 0,
            max_niceness: 19,
            max_blocked_rss_starvation_ratio: 0.5,
            promise_policy: PromisePolicy::Strict,
            max_job_rss: None,
            dynamic_group_idle_secs: 60,
            peer_attach_timeout_ms: 5000,
            peer_write_timeout_ms: 2000,
            kill_grace_ms: 5000,
            tree_check_live_promises: false,
            require_root: false,
        }
    }
}

impl SchedulerConfig {
    pub fn with_managed_memory(mut self, bytes: u64) -> Self {
        self.managed_memory = Some(bytes);
        self
    }

    pub fn with_promise_policy(mut self, policy: PromisePolicy) -> Self {
        self.promise_policy = policy;
        self
    }

    pub fn with_max_job_rss(mut self, bytes: u64) -> Self {
        self.max_job_rss = Some(bytes);
        self
    }

    pub fn with_niceness_range(mut self, min: i32, max: i32) -> Self {
        self.min_niceness = min;
        self.max_niceness = max;
        self
    }

    pub fn with_dynamic_group_idle_secs(mut self, secs: i64) -> Self {
        self.dynamic_group_idle_secs = secs;
        self
    }

    /// Read the config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let config: Self = serde_json::from_str(&contents)?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_niceness > self.max_niceness {
            return Err(WavaError::Internal(format!(
                "minNiceness {} is above maxNiceness {}",
                self.min_niceness, self.max_niceness
            )));
        }
        if !(0.0..=1.0).contains(&self.max_blocked_rss_starvation_ratio) {
            return Err(WavaError::Internal(format!(
                "maxBlockedRssStarvationRatio {} is outside [0, 1]",
                self.max_blocked_rss_starvation_ratio
            )));
        }
        if self.refresh_interval_ms == 0 {
            return Err(WavaError::Internal("refreshIntervalMs must be positive".into()));
        }
        Ok(())
    }
}

/// Filesystem layout rooted at `$WAVA_HOME`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavaHome {
    root: PathBuf,
}

impl WavaHome {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Result<Self> {
        match std::env::var_os(HOME_ENV) {
            Some(root) if !root.is_empty() => Ok(Self::new(root)),
            _ => Err(WavaError::HomeNotSet),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mailbox_dir(&self) -> PathBuf {
        self.root.join("mailbox")
    }

    pub fn streams_dir(&self) -> PathBuf {
        self.root.join("streams")
    }

    pub fn request_streams_dir(&self, id: u64) -> PathBuf {
        self.streams_dir().join(id.to_string())
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("wava.lock")
    }

    pub fn counter_file(&self) -> PathBuf {
        self.root.join("counter")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("etc").join("wava.json")
    }

    pub fn create_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.mailbox_dir())?;
        std::fs::create_dir_all(self.streams_dir())?;
        Ok(())
    }
}

/// Parse a memory size such as `512M`, `2G`, `64k` or a raw byte count.
pub fn parse_memory(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, suffix) = text.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let multiplier: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        "t" | "tb" => 1 << 40,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

/// Inverse of [`parse_memory`] for display purposes.
pub fn format_memory(bytes: u64) -> String {
    const UNITS: [(&str, u64); 4] = [("T", 1 << 40), ("G", 1 << 30), ("M", 1 << 20), ("K", 1 << 10)];
    for (unit, size) in UNITS {
        if bytes >= size && bytes % size == 0 {
            return format!("{}{}", bytes / size, unit);
        }
        if bytes >= size {
            return format!("{:.1}{}", bytes as f64 / size as f64, unit);
        }
    }
    format!("{}B", bytes)
}
