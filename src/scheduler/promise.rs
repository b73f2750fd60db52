use std::sync::Arc;

use crate::config::{PromisePolicy, SchedulerConfig};
use crate::scheduler::job::ProcessInfo;

/// Outcome of a promise violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep the job running under a raised promise.
    Allowed { new_promise: u64 },
    /// Kill the job's process tree.
    Disallowed,
}

/// Decides what happens when a running job's tree RSS exceeds its promise.
pub trait PromiseHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// `available` is what is left of the budget in the current refresh
    /// cycle and may already be negative.
    fn promise_failed(&self, available: i64, process: &ProcessInfo, observed_rss: u64) -> Verdict;
}

/// Every overrun is fatal.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictPromiseHandler;

impl PromiseHandler for StrictPromiseHandler {
    fn name(&self) -> &'static str {
        "strict"
    }

    fn promise_failed(&self, _available: i64, _process: &ProcessInfo, _observed_rss: u64) -> Verdict {
        Verdict::Disallowed
    }
}

/// Overruns are absorbed while the budget can take them. Past that point a
/// job is only killed when it is also above the per-job ceiling.
#[derive(Debug, Clone, Copy)]
pub struct LaxPromiseHandler {
    ceiling: u64,
}

impl LaxPromiseHandler {
    pub fn new(ceiling: u64) -> Self {
        Self { ceiling }
    }
}

impl PromiseHandler for LaxPromiseHandler {
    fn name(&self) -> &'static str {
        "lax"
    }

    fn promise_failed(&self, available: i64, process: &ProcessInfo, observed_rss: u64) -> Verdict {
        let growth = observed_rss.saturating_sub(process.promised_rss);
        let fits = i64::try_from(growth).map_or(false, |growth| growth <= available);
        if !fits && observed_rss > self.ceiling {
            Verdict::Disallowed
        } else {
            Verdict::Allowed {
                new_promise: observed_rss,
            }
        }
    }
}

/// Build the configured policy. The lax ceiling defaults to the managed capacity.
pub fn from_config(config: &SchedulerConfig, managed_capacity: u64) -> Arc<dyn PromiseHandler> {
    match config.promise_policy {
        PromisePolicy::Strict => Arc::new(StrictPromiseHandler),
        PromisePolicy::Lax => Arc::new(LaxPromiseHandler::new(
            config.max_job_rss.unwrap_or(managed_capacity),
        )),
    }
}
