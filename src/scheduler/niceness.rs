use std::sync::Arc;

use crate::config::SchedulerConfig;

/// Maps a running job's priority rank onto an OS niceness.
pub trait NicenessHandler: Send + Sync {
    /// `rank` is 0-based, highest priority first, out of `total` running jobs.
    fn niceness(&self, rank: usize, total: usize) -> i32;
}

/// Spreads running jobs evenly over `[min, max]`.
#[derive(Debug, Clone, Copy)]
pub struct SpreadNiceness {
    min: i32,
    max: i32,
}

impl SpreadNiceness {
    pub fn new(min: i32, max: i32) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }
}

impl NicenessHandler for SpreadNiceness {
    fn niceness(&self, rank: usize, total: usize) -> i32 {
        distribute(rank, total, self.min, self.max)
    }
}

pub fn from_config(config: &SchedulerConfig) -> Arc<dyn NicenessHandler> {
    Arc::new(SpreadNiceness::new(config.min_niceness, config.max_niceness))
}

/// Each niceness value is used `total / range` or `total / range + 1` times,
/// the larger buckets going to the higher-priority ranks, and consecutive
/// ranks never differ by more than one step.
pub fn distribute(rank: usize, total: usize, min: i32, max: i32) -> i32 {
    if total == 0 || max <= min {
        return min;
    }
    let range = (max - min) as usize + 1;
    let base = total / range;
    let extra = total % range;
    let big = base + 1;
    let boundary = extra * big;

    let offset = if rank < boundary {
        rank / big
    } else if base == 0 {
        range - 1
    } else {
        extra + (rank - boundary) / base
    };
    min + offset.min(range - 1) as i32
}
