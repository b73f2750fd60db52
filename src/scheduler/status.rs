//! Text tables for the `jobs` and `group list` operations.

use std::fmt::Write;

use serde::Serialize;

use super::{GroupInfo, JobState, Scheduler};
use crate::config::format_memory;

/// Point-in-time view of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: u64,
    pub state: String,
    pub group: String,
    pub user: u32,
    pub command: String,
    pub promised_rss: u64,
    pub max_rss: u64,
    pub niceness: Option<i32>,
    /// 1-based queue position, `None` while running.
    pub position: Option<usize>,
}

impl Scheduler {
    /// Running jobs in priority order, then queued jobs in queue order.
    pub async fn jobs(&self) -> Vec<JobSnapshot> {
        let state = self.state.lock().await;
        let running = state.job_set.running_ids();
        let queued = state.job_set.queued_ids();

        let mut rows = Vec::with_capacity(running.len() + queued.len());
        for id in running {
            let (Some(job), process) = (state.jobs.get(&id), state.processes.get(&id)) else {
                continue;
            };
            rows.push(JobSnapshot {
                id,
                state: JobState::Running.to_string(),
                group: job.group.clone(),
                user: job.user,
                command: job.request.command_line(),
                promised_rss: process.map_or(job.request.max_rss, |p| p.promised_rss),
                max_rss: process.map_or(0, |p| p.max_seen_rss),
                niceness: process.and_then(|p| p.niceness),
                position: None,
            });
        }
        for (index, id) in queued.into_iter().enumerate() {
            let Some(job) = state.jobs.get(&id) else {
                continue;
            };
            rows.push(JobSnapshot {
                id,
                state: JobState::Queued.to_string(),
                group: job.group.clone(),
                user: job.user,
                command: job.request.command_line(),
                promised_rss: job.request.max_rss,
                max_rss: 0,
                niceness: None,
                position: Some(index + 1),
            });
        }
        rows
    }
}

pub fn render_jobs(rows: &[JobSnapshot], no_headers: bool) -> String {
    let mut out = String::new();
    if !no_headers {
        let _ = writeln!(
            out,
            "{:<8} {:<8} {:<6} {:<16} {:<6} {:>9} {:>9} {:>4} COMMAND",
            "ID", "STATE", "POS", "GROUP", "UID", "PROMISED", "MAX RSS", "NICE"
        );
    }
    for row in rows {
        let position = row.position.map_or_else(|| "-".to_string(), |p| p.to_string());
        let niceness = row.niceness.map_or_else(|| "-".to_string(), |n| n.to_string());
        let command = if row.command.chars().count() > 40 {
            format!("{}...", row.command.chars().take(37).collect::<String>())
        } else {
            row.command.clone()
        };
        let _ = writeln!(
            out,
            "{:<8} {:<8} {:<6} {:<16} {:<6} {:>9} {:>9} {:>4} {}",
            row.id,
            row.state,
            position,
            row.group,
            row.user,
            format_memory(row.promised_rss),
            format_memory(row.max_rss),
            niceness,
            command
        );
    }
    out
}

pub fn render_groups(groups: &[GroupInfo], no_headers: bool) -> String {
    let mut out = String::new();
    if !no_headers {
        let _ = writeln!(
            out,
            "{:<20} {:>4} {:>8} {:<6} {:>6} {:<8} TTL",
            "NAME", "ID", "PRIORITY", "OWNER", "JOBS", "KIND"
        );
    }
    for group in groups {
        let ttl = if group.is_eternal() {
            "-".to_string()
        } else {
            format!("{}s", group.time_to_idle)
        };
        let _ = writeln!(
            out,
            "{:<20} {:>4} {:>8} {:<6} {:>6} {:<8} {}",
            group.name,
            group.id,
            group.priority,
            group.owner,
            group.jobs.len(),
            if group.dynamic { "dynamic" } else { "static" },
            ttl
        );
    }
    out
}
