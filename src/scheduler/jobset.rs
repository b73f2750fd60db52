use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;

use crate::error::{Result, WavaError};

/// Total scheduling order: priority first, then group id, then job id.
///
/// Lower keys are served first. Job ids grow with submission, so jobs of
/// one group are served in id order and a requeued job keeps its place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    pub priority: i32,
    pub group_id: u64,
    pub job_id: u64,
}

impl Key {
    pub fn new(priority: i32, group_id: u64, job_id: u64) -> Self {
        Self {
            priority,
            group_id,
            job_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Absent,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Absent => write!(f, "absent"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Queued,
    Running,
}

/// Two disjoint priority-ordered sets of job ids plus an id index.
///
/// Lookups by id go through the index, so removal never needs the caller to
/// know the full [`Key`]. Cursors hold the set mutably: while one is alive,
/// the only way to mutate the set is through the cursor.
#[derive(Debug, Default)]
pub struct JobSet {
    queued: BTreeSet<Key>,
    running: BTreeSet<Key>,
    index: HashMap<u64, (Key, Slot)>,
}

impl JobSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `id` as queued.
    pub fn queue(&mut self, id: u64, major: i32, minor: u64) -> Result<()> {
        if self.index.contains_key(&id) {
            return Err(WavaError::DuplicateId(id));
        }
        let key = Key::new(major, minor, id);
        self.queued.insert(key);
        self.index.insert(id, (key, Slot::Queued));
        Ok(())
    }

    /// Move `id` from queued to running.
    pub fn run(&mut self, id: u64) -> Result<()> {
        match self.index.get_mut(&id) {
            Some((key, slot @ Slot::Queued)) => {
                self.queued.remove(&*key);
                self.running.insert(*key);
                *slot = Slot::Running;
                Ok(())
            }
            _ => Err(WavaError::NotQueued(id)),
        }
    }

    /// Forget `id`; untracked ids are ignored.
    pub fn remove(&mut self, id: u64) {
        if let Some((key, slot)) = self.index.remove(&id) {
            match slot {
                Slot::Queued => self.queued.remove(&key),
                Slot::Running => self.running.remove(&key),
            };
        }
    }

    /// Re-key `id` inside whichever set holds it.
    pub fn set_priority(&mut self, id: u64, major: i32, minor: u64) {
        let Some((key, slot)) = self.index.get_mut(&id) else {
            return;
        };
        if key.priority == major && key.group_id == minor {
            return;
        }
        let set = match slot {
            Slot::Queued => &mut self.queued,
            Slot::Running => &mut self.running,
        };
        set.remove(&*key);
        *key = Key::new(major, minor, id);
        set.insert(*key);
    }

    pub fn state(&self, id: u64) -> JobState {
        match self.index.get(&id) {
            Some((_, Slot::Queued)) => JobState::Queued,
            Some((_, Slot::Running)) => JobState::Running,
            None => JobState::Absent,
        }
    }

    pub fn key(&self, id: u64) -> Option<Key> {
        self.index.get(&id).map(|(key, _)| *key)
    }

    /// Lowest-key queued job.
    pub fn peek_queued(&self) -> Option<u64> {
        self.queued.first().map(|key| key.job_id)
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Queued ids in scheduling order.
    pub fn queued_ids(&self) -> Vec<u64> {
        self.queued.iter().map(|key| key.job_id).collect()
    }

    /// Running ids in scheduling order (highest priority first).
    pub fn running_ids(&self) -> Vec<u64> {
        self.running.iter().map(|key| key.job_id).collect()
    }

    pub fn queue_cursor(&mut self) -> QueueCursor<'_> {
        QueueCursor {
            set: self,
            current: None,
        }
    }

    pub fn running_cursor(&mut self) -> RunningCursor<'_> {
        RunningCursor {
            set: self,
            current: None,
        }
    }

    fn next_after(set: &BTreeSet<Key>, current: Option<Key>) -> Option<Key> {
        match current {
            None => set.first().copied(),
            Some(key) => set
                .range((Bound::Excluded(key), Bound::Unbounded))
                .next()
                .copied(),
        }
    }
}

/// Ordered walk over the queued set that may promote or drop the current job.
pub struct QueueCursor<'a> {
    set: &'a mut JobSet,
    current: Option<Key>,
}

impl QueueCursor<'_> {
    pub fn next(&mut self) -> Option<u64> {
        let next = JobSet::next_after(&self.set.queued, self.current)?;
        self.current = Some(next);
        Some(next.job_id)
    }

    /// Promote the job last returned by [`next`](Self::next) to running.
    pub fn move_to_running(&mut self) -> Result<()> {
        let key = self
            .current
            .ok_or_else(|| WavaError::Internal("cursor has no current job".into()))?;
        self.set.run(key.job_id)
    }

    /// Drop the job last returned by [`next`](Self::next).
    pub fn remove(&mut self) {
        if let Some(key) = self.current {
            self.set.remove(key.job_id);
        }
    }
}

/// Ordered walk over the running set that may drop the current job.
pub struct RunningCursor<'a> {
    set: &'a mut JobSet,
    current: Option<Key>,
}

impl RunningCursor<'_> {
    pub fn next(&mut self) -> Option<u64> {
        let next = JobSet::next_after(&self.set.running, self.current)?;
        self.current = Some(next);
        Some(next.job_id)
    }

    pub fn remove(&mut self) {
        if let Some(key) = self.current {
            self.set.remove(key.job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_order_priority_group_then_id() {
        let mut keys = vec![
            Key::new(1, 0, 1),
            Key::new(0, 2, 5),
            Key::new(0, 1, 9),
            Key::new(0, 1, 3),
        ];
        keys.sort();
        let ids: Vec<u64> = keys.iter().map(|k| k.job_id).collect();
        assert_eq!(ids, vec![3, 9, 5, 1]);
    }

    #[test]
    fn lower_id_dequeues_first() {
        let mut set = JobSet::new();
        set.queue(6, 0, 1).unwrap();
        set.queue(5, 0, 1).unwrap();
        assert_eq!(set.queued_ids(), vec![5, 6]);
        assert_eq!(set.peek_queued(), Some(5));
    }

    #[test]
    fn cursor_removal_keeps_walking() {
        let mut set = JobSet::new();
        for id in 1..=4 {
            set.queue(id, 0, 0).unwrap();
        }
        let mut cursor = set.queue_cursor();
        let mut seen = Vec::new();
        while let Some(id) = cursor.next() {
            seen.push(id);
            if id % 2 == 0 {
                cursor.remove();
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);
        assert_eq!(set.queued_ids(), vec![1, 3]);
    }

    #[test]
    fn cursor_promotion_moves_to_running() {
        let mut set = JobSet::new();
        set.queue(1, 0, 0).unwrap();
        set.queue(2, 0, 0).unwrap();
        let mut cursor = set.queue_cursor();
        assert_eq!(cursor.next(), Some(1));
        cursor.move_to_running().unwrap();
        assert_eq!(cursor.next(), Some(2));
        assert_eq!(cursor.next(), None);
        assert_eq!(set.state(1), JobState::Running);
        assert_eq!(set.state(2), JobState::Queued);
    }

    #[test]
    fn requeue_keeps_id_order() {
        let mut set = JobSet::new();
        for id in 1..=3 {
            set.queue(id, 0, 0).unwrap();
        }
        set.run(1).unwrap();
        set.remove(1);
        set.queue(1, 0, 0).unwrap();
        assert_eq!(set.queued_ids(), vec![1, 2, 3]);
        assert!(set.running_ids().is_empty());
    }

    #[test]
    fn set_priority_rekeys_in_place() {
        let mut set = JobSet::new();
        set.queue(1, 5, 1).unwrap();
        set.queue(2, 5, 1).unwrap();
        set.queue(3, 0, 0).unwrap();
        set.set_priority(2, -1, 1);
        assert_eq!(set.queued_ids(), vec![2, 3, 1]);
        set.run(2).unwrap();
        set.set_priority(2, 7, 1);
        assert_eq!(set.state(2), JobState::Running);
        assert_eq!(set.key(2).map(|k| k.priority), Some(7));
    }

    #[test]
    fn duplicate_ids_are_refused() {
        let mut set = JobSet::new();
        set.queue(1, 0, 0).unwrap();
        assert!(matches!(set.queue(1, 0, 0), Err(WavaError::DuplicateId(1))));
        set.run(1).unwrap();
        assert!(matches!(set.run(1), Err(WavaError::NotQueued(1))));
        set.remove(1);
        assert!(set.is_empty());
    }

    #[test]
    fn move_without_current_fails() {
        let mut set = JobSet::new();
        set.queue(1, 0, 0).unwrap();
        assert!(set.queue_cursor().move_to_running().is_err());
    }
}
