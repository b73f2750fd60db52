use std::sync::Arc;

use super::{JobState, KillReason, Launch, ProcessInfo, Scheduler, SchedulerState, Verdict};
use crate::protocol::Event;

impl Scheduler {
    /// One scheduling cycle.
    ///
    /// Runs entirely under the state lock: drops jobs whose peers vanished,
    /// enforces promises, admits queued jobs in strict order, spreads
    /// niceness over running jobs, reports queue positions and resolves
    /// starvation. Admitted jobs are spawned once the lock is released.
    pub async fn refresh(self: &Arc<Self>) {
        let launches = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.closed {
                return;
            }

            self.clean_stale_peers(state).await;
            let mut available = self.available_memory(state);
            self.check_promises(state, &mut available).await;
            let launches = self.dequeue_jobs(state, available).await;
            self.distribute_niceness(state).await;
            self.send_queue_positions(state).await;
            self.check_starvation(state).await;
            launches
        };

        for launch in launches {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.run_job(launch).await;
            });
        }
    }

    async fn clean_stale_peers(self: &Arc<Self>, state: &mut SchedulerState) {
        let mut dropped = Vec::new();
        {
            let mut cursor = state.job_set.queue_cursor();
            while let Some(id) = cursor.next() {
                let alive = match state.jobs.get(&id) {
                    Some(job) => job.peer.ping().await,
                    None => false,
                };
                if !alive {
                    cursor.remove();
                    dropped.push(id);
                }
            }
        }
        for id in dropped {
            if let Some(job) = self.forget_job(state, id, JobState::Queued) {
                tracing::info!(job_id = id, "Dropping queued job, peer is gone");
                job.peer.close().await;
            }
        }

        let mut stale = Vec::new();
        for id in state.job_set.running_ids() {
            if let Some(job) = state.jobs.get(&id) {
                if !job.peer.ping().await {
                    stale.push(id);
                }
            }
        }
        for id in stale {
            self.kill_job(state, id, KillReason::StalePeer);
        }
    }

    /// Budget left for this cycle. Killed jobs keep their promise until
    /// their process is gone.
    fn available_memory(&self, state: &SchedulerState) -> i64 {
        let promised: u64 = state.processes.values().map(|p| p.promised_rss).sum();
        let budget = self.managed_capacity as i64 - promised as i64;
        budget.min(self.os.free_memory() as i64)
    }

    async fn check_promises(&self, state: &mut SchedulerState, available: &mut i64) {
        let mut disallowed = Vec::new();

        for id in state.job_set.running_ids() {
            let Some(process) = state.processes.get_mut(&id) else {
                continue;
            };
            if process.killing.is_some() {
                continue;
            }
            let Some(pid) = process.pid else {
                continue;
            };
            let Some(stats) = self.os.tree_stats(pid) else {
                continue;
            };
            process.max_seen_rss = process.max_seen_rss.max(stats.rss_bytes);
            process.cpu_time_ms = stats.cpu_time_ms;
            if stats.rss_bytes <= process.promised_rss {
                continue;
            }

            let Some(job) = state.jobs.get(&id) else {
                continue;
            };
            match self
                .promise_handler
                .promise_failed(*available, process, stats.rss_bytes)
            {
                Verdict::Allowed { new_promise } => {
                    let old = process.promised_rss;
                    process.promised_rss = new_promise;
                    *available += old as i64 - new_promise as i64;
                    if !process.allowed {
                        process.allowed = true;
                        job.peer
                            .send_event(&Event::ExceedAllowed(stats.rss_bytes))
                            .await;
                    }
                    tracing::info!(
                        job_id = id,
                        rss = stats.rss_bytes,
                        old_promise = old,
                        new_promise,
                        "Promise overrun tolerated"
                    );
                }
                Verdict::Disallowed => {
                    tracing::warn!(
                        job_id = id,
                        rss = stats.rss_bytes,
                        promise = process.promised_rss,
                        "Promise exceeded"
                    );
                    job.peer
                        .send_event(&Event::ExceedDisallowed(stats.rss_bytes))
                        .await;
                    disallowed.push(id);
                }
            }
        }

        for id in disallowed {
            self.kill_job(state, id, KillReason::PromiseExceeded);
        }
    }

    /// Admit queued jobs from the head while their promise fits. The first
    /// job that does not fit blocks everything behind it.
    ///
    /// A relaunched starvation victim is held back while it still has queued
    /// children; it neither runs nor blocks the jobs behind it.
    async fn dequeue_jobs(&self, state: &mut SchedulerState, mut available: i64) -> Vec<Launch> {
        let mut launches = Vec::new();
        {
            let mut cursor = state.job_set.queue_cursor();
            while let Some(id) = cursor.next() {
                let Some(job) = state.jobs.get_mut(&id) else {
                    cursor.remove();
                    continue;
                };
                if job.relaunched && job.queued_children > 0 {
                    continue;
                }
                let promise = job.request.max_rss;
                if promise as i64 > available {
                    break;
                }
                if let Err(e) = cursor.move_to_running() {
                    tracing::error!(job_id = id, error = %e, "Failed to promote job");
                    break;
                }
                available -= promise as i64;
                job.previous_position = None;
                job.relaunched = false;
                launches.push(Launch {
                    job_id: id,
                    request: job.request.clone(),
                    peer: job.peer.clone(),
                });
            }
        }

        for launch in &launches {
            state.processes.insert(
                launch.job_id,
                ProcessInfo::new(launch.job_id, launch.request.max_rss),
            );
            if let Some(parent) = launch
                .request
                .parent_id
                .and_then(|p| state.jobs.get_mut(&p))
            {
                parent.queued_children = parent.queued_children.saturating_sub(1);
                parent.running_children += 1;
            }
            tracing::info!(
                job_id = launch.job_id,
                max_rss = launch.request.max_rss,
                available,
                "Job admitted"
            );
            launch.peer.send_event(&Event::Running).await;
        }
        launches
    }

    async fn distribute_niceness(&self, state: &mut SchedulerState) {
        let running = state.job_set.running_ids();
        let total = running.len();
        for (rank, id) in running.iter().enumerate() {
            let niceness = self.niceness_handler.niceness(rank, total);
            let Some(process) = state.processes.get_mut(id) else {
                continue;
            };
            let Some(pid) = process.pid else {
                continue;
            };
            if process.killing.is_some() || process.niceness == Some(niceness) {
                continue;
            }
            process.niceness = Some(niceness);
            match self.os.set_niceness(pid, niceness) {
                Ok(()) => {
                    tracing::debug!(job_id = id, pid, niceness, "Niceness updated");
                    if let Some(job) = state.jobs.get(id) {
                        job.peer.send_event(&Event::Niceness(niceness)).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id = id, pid, niceness, error = %e, "Failed to set niceness");
                }
            }
        }
    }

    async fn send_queue_positions(&self, state: &mut SchedulerState) {
        for (index, id) in state.job_set.queued_ids().into_iter().enumerate() {
            let position = index + 1;
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            if job.previous_position != Some(position) {
                job.previous_position = Some(position);
                job.peer.send_event(&Event::Queued(position)).await;
            }
        }
    }

    /// Break a deadlock between running parents and their queued children.
    ///
    /// Triggers when the queue is non-empty and either every running job is
    /// blocked, or blocked jobs hold more than the configured share of the
    /// managed capacity. One victim per resolution: an idempotent blocked job
    /// is preferred (and relaunched later), otherwise the lowest-priority
    /// blocked job is stopped.
    async fn check_starvation(&self, state: &mut SchedulerState) {
        if state.job_set.queued_len() == 0 {
            return;
        }
        let running = state.job_set.running_ids();
        if running.is_empty() {
            return;
        }
        let resolving = running.iter().any(|id| {
            state
                .processes
                .get(id)
                .is_some_and(|p| p.killing == Some(KillReason::Starvation))
        });
        if resolving {
            return;
        }

        let blocked: Vec<u64> = running
            .iter()
            .copied()
            .filter(|id| state.jobs.get(id).is_some_and(|job| job.is_blocked()))
            .collect();
        if blocked.is_empty() {
            return;
        }

        let all_blocked = blocked.len() == running.len();
        let blocked_rss: u64 = blocked
            .iter()
            .filter_map(|id| state.processes.get(id))
            .map(|p| p.promised_rss)
            .sum();
        let threshold = self.managed_capacity as f64 * self.config.max_blocked_rss_starvation_ratio;
        if !all_blocked && blocked_rss as f64 <= threshold {
            return;
        }

        let victim = blocked
            .iter()
            .rev()
            .find(|id| state.jobs.get(*id).is_some_and(|job| job.request.idempotent))
            .or(blocked.last())
            .copied();
        let Some(victim) = victim else {
            return;
        };
        let Some(job) = state.jobs.get_mut(&victim) else {
            return;
        };

        if job.request.idempotent {
            job.relaunched = true;
            tracing::warn!(
                job_id = victim,
                blocked = blocked.len(),
                blocked_rss,
                "Starvation detected, relaunching job"
            );
            job.peer.send_event(&Event::StarvationRelaunch).await;
        } else {
            tracing::warn!(
                job_id = victim,
                blocked = blocked.len(),
                blocked_rss,
                "Starvation detected, stopping job"
            );
            job.peer.send_event(&Event::DeadlockStop).await;
        }
        self.kill_job(state, victim, KillReason::Starvation);
    }
}
