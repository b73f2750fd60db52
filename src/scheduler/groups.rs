//! Group lifecycle: dynamic creation on submit, explicit create/update,
//! delete, and reaping of idle groups.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{GroupInfo, Scheduler, SchedulerState, ROOT_UID};
use crate::config::DEFAULT_GROUP;
use crate::error::{Result, WavaError};
use crate::protocol::{Event, GroupRequest};

impl Scheduler {
    /// Look up a group, creating a dynamic one owned by `user` if needed.
    pub(super) fn ensure_group<'a>(
        &self,
        state: &'a mut SchedulerState,
        name: &str,
        user: u32,
    ) -> &'a mut GroupInfo {
        let next_group_id = &mut state.next_group_id;
        let idle = self.config.dynamic_group_idle_secs;
        state.groups.entry(name.to_string()).or_insert_with(|| {
            let id = *next_group_id;
            *next_group_id += 1;
            tracing::info!(group = %name, group_id = id, owner = user, "Dynamic group created");
            GroupInfo::new(name.to_string(), id, user, 0, idle, true)
        })
    }

    /// Drop `job_id` from its group and start the idle clock if it was the last member.
    pub(super) fn leave_group(self: &Arc<Self>, state: &mut SchedulerState, name: &str, job_id: u64) {
        let Some(group) = state.groups.get_mut(name) else {
            return;
        };
        group.jobs.remove(&job_id);
        if !group.jobs.is_empty() {
            return;
        }
        group.empty_since = Some(Instant::now());
        self.schedule_reap(state, name);
    }

    fn schedule_reap(self: &Arc<Self>, state: &mut SchedulerState, name: &str) {
        let Some(group) = state.groups.get(name) else {
            return;
        };
        if name == DEFAULT_GROUP || group.is_eternal() || !group.jobs.is_empty() {
            return;
        }
        if group.time_to_idle == 0 {
            reap_group(state, name);
            return;
        }

        let idle = Duration::from_secs(group.time_to_idle as u64);
        let scheduler = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let mut state = scheduler.state.lock().await;
            reap_group(&mut state, &name);
        });
    }

    /// Create a group, or update the priority and idle time of an existing one.
    ///
    /// A priority change re-keys every member in the job set and notifies
    /// each member's peer.
    pub async fn update_group(self: &Arc<Self>, request: &GroupRequest, user: u32) -> Result<GroupInfo> {
        let name = group_name(request)?;
        if request.priority.is_some_and(|p| p < 0) && user != ROOT_UID {
            return Err(WavaError::PermissionDenied(
                "negative priorities are reserved to root".to_string(),
            ));
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.closed {
            return Err(WavaError::Closed);
        }

        let Some(group) = state.groups.get_mut(name) else {
            let id = state.next_group_id;
            state.next_group_id += 1;
            let group = GroupInfo::new(
                name.to_string(),
                id,
                user,
                request.priority.unwrap_or(0),
                request.time_to_idle.unwrap_or(-1),
                false,
            );
            tracing::info!(
                group = %name,
                group_id = id,
                owner = user,
                priority = group.priority,
                time_to_idle = group.time_to_idle,
                "Group created"
            );
            state.groups.insert(name.to_string(), group.clone());
            self.schedule_reap(state, name);
            return Ok(group);
        };

        if user != ROOT_UID && user != group.owner {
            return Err(WavaError::PermissionDenied(format!(
                "group {name} belongs to uid {}",
                group.owner
            )));
        }

        if let Some(time_to_idle) = request.time_to_idle {
            group.time_to_idle = time_to_idle;
            group.dynamic = false;
        }
        let reprioritised = match request.priority {
            Some(priority) if priority != group.priority => {
                group.priority = priority;
                true
            }
            _ => false,
        };
        let updated = group.clone();

        tracing::info!(
            group = %name,
            priority = updated.priority,
            time_to_idle = updated.time_to_idle,
            members = updated.jobs.len(),
            "Group updated"
        );

        if reprioritised {
            for id in &updated.jobs {
                state.job_set.set_priority(*id, updated.priority, updated.id);
                if let Some(job) = state.jobs.get(id) {
                    job.peer.send_event(&Event::Priority(updated.priority)).await;
                }
            }
        }
        if updated.jobs.is_empty() {
            self.schedule_reap(state, name);
        }

        drop(guard);
        if reprioritised {
            self.request_refresh();
        }
        Ok(updated)
    }

    /// Delete an empty group. The default group is never deleted.
    pub async fn delete_group(&self, name: &str, user: u32) -> Result<()> {
        if name == DEFAULT_GROUP {
            return Err(WavaError::Rejected(
                "the default group cannot be deleted".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        let group = state
            .groups
            .get(name)
            .ok_or_else(|| WavaError::GroupNotFound(name.to_string()))?;
        if user != ROOT_UID && user != group.owner {
            return Err(WavaError::PermissionDenied(format!(
                "group {name} belongs to uid {}",
                group.owner
            )));
        }
        if !group.jobs.is_empty() {
            return Err(WavaError::GroupNotEmpty {
                name: name.to_string(),
                jobs: group.jobs.len(),
            });
        }

        state.groups.remove(name);
        tracing::info!(group = %name, user, "Group deleted");
        Ok(())
    }

    pub async fn group(&self, name: &str) -> Option<GroupInfo> {
        self.state.lock().await.groups.get(name).cloned()
    }

    /// All groups sorted by priority, then creation order.
    pub async fn groups(&self) -> Vec<GroupInfo> {
        let state = self.state.lock().await;
        let mut groups: Vec<GroupInfo> = state.groups.values().cloned().collect();
        groups.sort_by_key(|g| (g.priority, g.id));
        groups
    }
}

fn group_name(request: &GroupRequest) -> Result<&str> {
    match request.name.as_deref() {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(WavaError::Protocol("group name is required".to_string())),
    }
}

/// Remove a group that stayed empty for its whole idle period.
fn reap_group(state: &mut SchedulerState, name: &str) {
    let expired = state.groups.get(name).is_some_and(|group| {
        name != DEFAULT_GROUP
            && !group.is_eternal()
            && group.jobs.is_empty()
            && group
                .empty_since
                .is_some_and(|since| since.elapsed() >= Duration::from_secs(group.time_to_idle as u64))
    });
    if expired {
        state.groups.remove(name);
        tracing::info!(group = %name, "Idle group removed");
    }
}
