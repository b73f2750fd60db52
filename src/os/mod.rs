//! Narrow interface to the operating system.
//!
//! The scheduler never touches processes directly; it enumerates, samples,
//! renices and kills process trees through [`ProcessOs`]. [`LinuxOs`] is the
//! procfs-backed implementation used by the daemon.

mod linux;

pub use linux::LinuxOs;
pub use nix::sys::signal::Signal;

/// Aggregated resource usage of a process and all its descendants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub rss_bytes: u64,
    pub cpu_time_ms: u64,
}

pub trait ProcessOs: Send + Sync {
    /// `pid` followed by all of its live descendants.
    fn process_tree(&self, pid: u32) -> Vec<u32>;

    /// Signal every process of the tree rooted at `pid`.
    fn kill_tree(&self, pid: u32, signal: Signal);

    /// `None` when the root process no longer exists.
    fn tree_stats(&self, pid: u32) -> Option<TreeStats>;

    fn set_niceness(&self, pid: u32, niceness: i32) -> std::io::Result<()>;

    /// Memory currently available to new allocations, in bytes.
    fn free_memory(&self) -> u64;

    fn total_memory(&self) -> u64;
}
