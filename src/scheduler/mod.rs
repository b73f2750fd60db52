//! Memory-aware admission control.
//!
//! All scheduling state (job table, process table, groups and the
//! [`JobSet`]) lives behind one mutex. Every operation, and each whole
//! [`refresh`](Scheduler::refresh) cycle, runs as a single critical section.
//! Process spawning and output streaming happen in per-job tasks outside
//! the lock.

pub mod groups;
pub mod job;
pub mod jobset;
pub mod niceness;
pub mod promise;
mod refresh;
pub mod status;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{SchedulerConfig, DEFAULT_GROUP};
use crate::error::{Result, WavaError};
use crate::os::{ProcessOs, Signal};
use crate::peer::PeerChannel;
use crate::protocol::{Event, JobRequest, RetCode};
use crate::worker::{ExecutionResult, JobExecutor};

pub use job::{GroupInfo, Job, KillReason, ProcessInfo};
pub use jobset::{JobSet, JobState, Key};
pub use niceness::{NicenessHandler, SpreadNiceness};
pub use promise::{LaxPromiseHandler, PromiseHandler, StrictPromiseHandler, Verdict};
pub use status::JobSnapshot;

pub const ROOT_UID: u32 = 0;

/// Everything guarded by the scheduler lock.
#[derive(Debug, Default)]
pub(crate) struct SchedulerState {
    jobs: HashMap<u64, Job>,
    processes: HashMap<u64, ProcessInfo>,
    groups: HashMap<String, GroupInfo>,
    job_set: JobSet,
    next_group_id: u64,
    closed: bool,
}

/// A job promoted to running, handed to its worker task.
#[derive(Debug)]
struct Launch {
    job_id: u64,
    request: JobRequest,
    peer: Arc<PeerChannel>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    os: Arc<dyn ProcessOs>,
    promise_handler: Arc<dyn PromiseHandler>,
    niceness_handler: Arc<dyn NicenessHandler>,
    executor: JobExecutor,
    managed_capacity: u64,
    state: Mutex<SchedulerState>,
    refresh_notify: Notify,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        os: Arc<dyn ProcessOs>,
        promise_handler: Arc<dyn PromiseHandler>,
        niceness_handler: Arc<dyn NicenessHandler>,
    ) -> Arc<Self> {
        let managed_capacity = config.managed_memory.unwrap_or_else(|| os.total_memory());

        let mut state = SchedulerState {
            next_group_id: 1,
            ..SchedulerState::default()
        };
        state.groups.insert(
            DEFAULT_GROUP.to_string(),
            GroupInfo::new(DEFAULT_GROUP.to_string(), 0, ROOT_UID, 0, -1, false),
        );

        tracing::info!(
            managed_capacity,
            promise_policy = promise_handler.name(),
            min_niceness = config.min_niceness,
            max_niceness = config.max_niceness,
            "Scheduler initialized"
        );

        Arc::new(Self {
            config,
            os,
            promise_handler,
            niceness_handler,
            executor: JobExecutor::new(),
            managed_capacity,
            state: Mutex::new(state),
            refresh_notify: Notify::new(),
        })
    }

    /// Build a scheduler with the policies named by `config`.
    pub fn from_config(config: SchedulerConfig, os: Arc<dyn ProcessOs>) -> Arc<Self> {
        let capacity = config.managed_memory.unwrap_or_else(|| os.total_memory());
        let promise_handler = promise::from_config(&config, capacity);
        let niceness_handler = niceness::from_config(&config);
        Self::new(config, os, promise_handler, niceness_handler)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn managed_capacity(&self) -> u64 {
        self.managed_capacity
    }

    /// Wake the refresh loop without waiting for the next tick.
    pub fn request_refresh(&self) {
        self.refresh_notify.notify_one();
    }

    /// Periodic refresh driver; also runs immediately after
    /// [`request_refresh`](Self::request_refresh).
    pub async fn run_refresh_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.refresh_interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.refresh_notify.notified() => {}
            }
            self.refresh().await;
        }
        tracing::info!("Refresh loop stopped");
    }

    /// Queue a job under request id `id`.
    ///
    /// Admission checks that fail are reported to `peer` with the matching
    /// `exceed_*` event before the error is returned; such jobs never enter
    /// the queue.
    pub async fn submit(
        self: &Arc<Self>,
        id: u64,
        request: JobRequest,
        user: u32,
        peer: Arc<PeerChannel>,
    ) -> Result<u64> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.closed {
            return Err(WavaError::Closed);
        }
        if state.jobs.contains_key(&id) {
            return Err(WavaError::DuplicateId(id));
        }
        self.check_admission(state, &request, &peer).await?;

        let group_name = request
            .group
            .clone()
            .unwrap_or_else(|| DEFAULT_GROUP.to_string());
        let (priority, group_id) = {
            let group = self.ensure_group(state, &group_name, user);
            group.jobs.insert(id);
            group.empty_since = None;
            (group.priority, group.id)
        };
        state.job_set.queue(id, priority, group_id)?;

        if let Some(parent) = request.parent_id.and_then(|p| state.jobs.get_mut(&p)) {
            parent.queued_children += 1;
        }

        tracing::info!(
            job_id = id,
            group = %group_name,
            user,
            max_rss = request.max_rss,
            parent_id = ?request.parent_id,
            command = %request.command_line(),
            "Job queued"
        );
        state
            .jobs
            .insert(id, Job::new(id, request, group_name, user, peer.clone()));
        peer.send_event(&Event::Id(id)).await;

        drop(guard);
        self.request_refresh();
        Ok(id)
    }

    /// Cancel a queued or running job. Only the owner or root may do so.
    pub async fn cancel(self: &Arc<Self>, id: u64, user: u32) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let owner = state
            .jobs
            .get(&id)
            .map(|job| job.user)
            .ok_or(WavaError::JobNotFound(id))?;
        if user != ROOT_UID && user != owner {
            return Err(WavaError::PermissionDenied(format!(
                "job {id} belongs to uid {owner}"
            )));
        }

        match state.job_set.state(id) {
            JobState::Queued => {
                if let Some(job) = self.remove_job(state, id) {
                    tracing::info!(job_id = id, user, "Queued job cancelled");
                    job.peer.send_event(&Event::Cancelled).await;
                    job.peer
                        .send_event(&Event::Retcode(RetCode::Cancelled.code()))
                        .await;
                    job.peer.close().await;
                }
            }
            JobState::Running => {
                tracing::info!(job_id = id, user, "Cancelling running job");
                self.kill_job(state, id, KillReason::Cancelled);
            }
            JobState::Absent => return Err(WavaError::JobNotFound(id)),
        }

        drop(guard);
        self.request_refresh();
        Ok(())
    }

    /// Refuse new work, cancel every queued job and tear down running ones.
    pub async fn close(self: &Arc<Self>) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.closed {
            return;
        }
        state.closed = true;

        let queued = state.job_set.queued_ids();
        let running = state.job_set.running_ids();
        tracing::info!(
            queued = queued.len(),
            running = running.len(),
            "Scheduler closing"
        );

        for id in queued {
            if let Some(job) = self.remove_job(state, id) {
                job.peer.send_event(&Event::Shutdown).await;
                job.peer
                    .send_event(&Event::Retcode(RetCode::Cancelled.code()))
                    .await;
                job.peer.close().await;
            }
        }
        for id in running {
            if let Some(job) = state.jobs.get(&id) {
                job.peer.send_event(&Event::Shutdown).await;
            }
            self.kill_job(state, id, KillReason::Shutdown);
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Wait until no job is tracked any more. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.state.lock().await.jobs.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn job_state(&self, id: u64) -> JobState {
        self.state.lock().await.job_set.state(id)
    }

    pub async fn job(&self, id: u64) -> Option<Job> {
        self.state.lock().await.jobs.get(&id).cloned()
    }

    pub async fn process(&self, id: u64) -> Option<ProcessInfo> {
        self.state.lock().await.processes.get(&id).cloned()
    }

    /// Sum of the current promises of running jobs.
    pub async fn promised_total(&self) -> u64 {
        self.state
            .lock()
            .await
            .processes
            .values()
            .map(|p| p.promised_rss)
            .sum()
    }

    pub async fn queued_ids(&self) -> Vec<u64> {
        self.state.lock().await.job_set.queued_ids()
    }

    pub async fn running_ids(&self) -> Vec<u64> {
        self.state.lock().await.job_set.running_ids()
    }

    async fn check_admission(
        &self,
        state: &SchedulerState,
        request: &JobRequest,
        peer: &PeerChannel,
    ) -> Result<()> {
        let promise = request.max_rss;
        if promise > self.managed_capacity {
            peer.send_event(&Event::ExceedGlobal(promise)).await;
            return Err(WavaError::Rejected(format!(
                "promised RSS {promise} exceeds managed capacity {}",
                self.managed_capacity
            )));
        }
        if let Some(ceiling) = self.config.max_job_rss {
            if promise > ceiling {
                peer.send_event(&Event::ExceedDisallowed(promise)).await;
                return Err(WavaError::Rejected(format!(
                    "promised RSS {promise} exceeds per-job ceiling {ceiling}"
                )));
            }
        }
        if request.parent_id.is_some() {
            let tree = promise.saturating_add(self.ancestor_promises(state, request.parent_id));
            if tree > self.managed_capacity {
                peer.send_event(&Event::ExceedTree(tree)).await;
                return Err(WavaError::Rejected(format!(
                    "RSS of job tree {tree} exceeds managed capacity {}",
                    self.managed_capacity
                )));
            }
        }
        Ok(())
    }

    fn ancestor_promises(&self, state: &SchedulerState, mut parent: Option<u64>) -> u64 {
        let mut seen = HashSet::new();
        let mut total = 0u64;
        while let Some(id) = parent {
            if !seen.insert(id) {
                break;
            }
            let Some(job) = state.jobs.get(&id) else {
                break;
            };
            let promise = if self.config.tree_check_live_promises {
                state
                    .processes
                    .get(&id)
                    .map_or(job.request.max_rss, |p| p.promised_rss)
            } else {
                job.request.max_rss
            };
            total = total.saturating_add(promise);
            parent = job.request.parent_id;
        }
        total
    }

    /// Remove a job from every table, keeping parent and group counters right.
    fn remove_job(self: &Arc<Self>, state: &mut SchedulerState, id: u64) -> Option<Job> {
        let former = state.job_set.state(id);
        state.job_set.remove(id);
        self.forget_job(state, id, former)
    }

    /// Same as [`remove_job`](Self::remove_job) for a job already gone from the JobSet.
    fn forget_job(
        self: &Arc<Self>,
        state: &mut SchedulerState,
        id: u64,
        former: JobState,
    ) -> Option<Job> {
        state.processes.remove(&id);
        let job = state.jobs.remove(&id)?;
        if let Some(parent) = job.request.parent_id.and_then(|p| state.jobs.get_mut(&p)) {
            match former {
                JobState::Queued => parent.queued_children = parent.queued_children.saturating_sub(1),
                JobState::Running => {
                    parent.running_children = parent.running_children.saturating_sub(1)
                }
                JobState::Absent => {}
            }
        }
        self.leave_group(state, &job.group, id);
        Some(job)
    }

    /// Start tearing down a running job's process tree.
    fn kill_job(&self, state: &mut SchedulerState, id: u64, reason: KillReason) {
        let Some(process) = state.processes.get_mut(&id) else {
            return;
        };
        let overriding = matches!(reason, KillReason::Cancelled | KillReason::Shutdown);
        if process.killing.is_some() && !overriding {
            return;
        }
        let first = process.killing.is_none();
        process.killing = Some(reason);
        if overriding {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.relaunched = false;
            }
        }
        tracing::info!(job_id = id, reason = %reason, pid = ?process.pid, "Killing job");
        if let (true, Some(pid)) = (first, process.pid) {
            self.terminate_tree(pid);
        }
    }

    /// SIGTERM now, SIGKILL sweep after the grace period.
    fn terminate_tree(&self, pid: u32) {
        self.os.kill_tree(pid, Signal::SIGTERM);
        let os = Arc::clone(&self.os);
        let grace = Duration::from_millis(self.config.kill_grace_ms);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            os.kill_tree(pid, Signal::SIGKILL);
        });
    }

    async fn run_job(self: Arc<Self>, launch: Launch) {
        let Launch {
            job_id,
            request,
            peer,
        } = launch;

        let child = match self.executor.spawn(job_id, &request) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    job_id,
                    command = %request.command_line(),
                    error = %e,
                    "Failed to launch job"
                );
                peer.log(&format!("wava: cannot run {}: {}", request.command_line(), e))
                    .await;
                peer.send_event(&Event::Error(e.to_string())).await;
                let result = ExecutionResult {
                    job_id,
                    exit_code: RetCode::Error.code(),
                    signal: None,
                };
                self.finish_job(result).await;
                self.request_refresh();
                return;
            }
        };

        match child.id() {
            Some(pid) => self.attach_pid(job_id, pid).await,
            None => tracing::warn!(job_id, "Job process exited before its pid was read"),
        }

        let result = self.executor.supervise(job_id, child, peer).await;
        self.finish_job(result).await;
        self.request_refresh();
    }

    async fn attach_pid(&self, job_id: u64, pid: u32) {
        let mut state = self.state.lock().await;
        match state.processes.get_mut(&job_id) {
            Some(process) => {
                process.pid = Some(pid);
                tracing::debug!(job_id, pid, "Job process started");
                if process.killing.is_some() {
                    self.terminate_tree(pid);
                }
            }
            None => self.terminate_tree(pid),
        }
    }

    /// Terminal bookkeeping once the job's process and output streams are done.
    async fn finish_job(self: &Arc<Self>, result: ExecutionResult) {
        let job_id = result.job_id;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let process = state.processes.remove(&job_id);
        let reason = process.as_ref().and_then(|p| p.killing);
        let relaunch = !state.closed
            && reason == Some(KillReason::Starvation)
            && state.jobs.get(&job_id).is_some_and(|job| job.relaunched);

        if relaunch {
            self.requeue(state, job_id);
            return;
        }

        let max_rss = process.map_or(0, |p| p.max_seen_rss);
        let Some(job) = self.remove_job(state, job_id) else {
            return;
        };
        drop(guard);

        let retcode = match reason {
            Some(KillReason::Cancelled) => {
                job.peer.send_event(&Event::Cancelled).await;
                RetCode::Cancelled.code()
            }
            Some(KillReason::Shutdown) => RetCode::Cancelled.code(),
            _ => result.exit_code,
        };
        job.peer.send_event(&Event::MaxRss(max_rss)).await;
        job.peer.send_event(&Event::Retcode(retcode)).await;
        job.peer.close().await;

        tracing::info!(
            job_id,
            exit_code = result.exit_code,
            retcode,
            max_rss,
            reason = ?reason,
            "Job finished"
        );
    }

    /// Put a starvation victim back in the queue under its original id, which
    /// keeps its place in the scheduling order.
    fn requeue(&self, state: &mut SchedulerState, job_id: u64) {
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return;
        };
        job.previous_position = None;
        let parent_id = job.request.parent_id;
        let (priority, group_id) = state
            .groups
            .get(&job.group)
            .map_or((0, 0), |g| (g.priority, g.id));

        state.job_set.remove(job_id);
        if let Err(e) = state.job_set.queue(job_id, priority, group_id) {
            tracing::error!(job_id, error = %e, "Failed to requeue relaunched job");
            return;
        }
        if let Some(parent) = parent_id.and_then(|p| state.jobs.get_mut(&p)) {
            parent.running_children = parent.running_children.saturating_sub(1);
            parent.queued_children += 1;
        }
        tracing::info!(job_id, "Relaunched job re-entered the queue");
    }
}
