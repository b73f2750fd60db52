use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use super::{ProcessOs, TreeStats};

/// procfs-backed [`ProcessOs`].
#[derive(Debug, Clone)]
pub struct LinuxOs {
    proc_root: PathBuf,
    clock_ticks: u64,
}

impl Default for LinuxOs {
    fn default() -> Self {
        Self::new()
    }
}

/// Fields of `/proc/<pid>/stat` the scheduler cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatLine {
    ppid: u32,
    utime: u64,
    stime: u64,
}

impl LinuxOs {
    pub fn new() -> Self {
        // SAFETY: sysconf has no preconditions.
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        Self {
            proc_root: PathBuf::from("/proc"),
            clock_ticks: if ticks > 0 { ticks as u64 } else { 100 },
        }
    }

    fn read_stat(&self, pid: u32) -> Option<StatLine> {
        let raw = fs::read_to_string(self.proc_root.join(pid.to_string()).join("stat")).ok()?;
        parse_stat(&raw)
    }

    fn read_rss(&self, pid: u32) -> Option<u64> {
        let raw = fs::read_to_string(self.proc_root.join(pid.to_string()).join("status")).ok()?;
        parse_kb_field(&raw, "VmRSS:")
    }

    /// parent pid -> child pids for every process currently visible.
    fn children_index(&self) -> HashMap<u32, Vec<u32>> {
        let mut index: HashMap<u32, Vec<u32>> = HashMap::new();
        let entries = match fs::read_dir(&self.proc_root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list procfs");
                return index;
            }
        };
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            if let Some(stat) = self.read_stat(pid) {
                index.entry(stat.ppid).or_default().push(pid);
            }
        }
        index
    }

    fn meminfo(&self, field: &str) -> u64 {
        match fs::read_to_string(self.proc_root.join("meminfo")) {
            Ok(raw) => parse_kb_field(&raw, field).unwrap_or(0),
            Err(e) => {
                tracing::warn!(error = %e, field, "failed to read meminfo");
                0
            }
        }
    }
}

impl ProcessOs for LinuxOs {
    fn process_tree(&self, pid: u32) -> Vec<u32> {
        if self.read_stat(pid).is_none() {
            return Vec::new();
        }
        let index = self.children_index();
        let mut tree = vec![pid];
        let mut cursor = 0;
        while cursor < tree.len() {
            if let Some(children) = index.get(&tree[cursor]) {
                tree.extend(children.iter().copied());
            }
            cursor += 1;
        }
        tree
    }

    fn kill_tree(&self, pid: u32, sig: Signal) {
        let tree = self.process_tree(pid);
        // Jobs run in their own process group, so this also reaches
        // descendants that were reparented away from the tree.
        match signal::killpg(Pid::from_raw(pid as i32), sig) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::debug!(pid, error = %e, "killpg failed"),
        }
        for member in tree {
            match signal::kill(Pid::from_raw(member as i32), sig) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::debug!(pid = member, error = %e, "kill failed"),
            }
        }
    }

    fn tree_stats(&self, pid: u32) -> Option<TreeStats> {
        let tree = self.process_tree(pid);
        if tree.is_empty() {
            return None;
        }
        let mut stats = TreeStats::default();
        for member in tree {
            stats.rss_bytes += self.read_rss(member).unwrap_or(0);
            if let Some(stat) = self.read_stat(member) {
                stats.cpu_time_ms += (stat.utime + stat.stime) * 1000 / self.clock_ticks;
            }
        }
        Some(stats)
    }

    fn set_niceness(&self, pid: u32, niceness: i32) -> io::Result<()> {
        for member in self.process_tree(pid) {
            // SAFETY: setpriority only reads its integer arguments.
            let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, member as libc::id_t, niceness) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn free_memory(&self) -> u64 {
        self.meminfo("MemAvailable:")
    }

    fn total_memory(&self) -> u64 {
        self.meminfo("MemTotal:")
    }
}

fn parse_stat(raw: &str) -> Option<StatLine> {
    // The command name may contain spaces and parentheses; fields resume
    // after the last ')'.
    let rest = &raw[raw.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    Some(StatLine {
        ppid: fields.get(1)?.parse().ok()?,
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
    })
}

fn parse_kb_field(raw: &str, field: &str) -> Option<u64> {
    raw.lines()
        .find_map(|line| line.trim_start().strip_prefix(field))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb.saturating_mul(1024))
}
