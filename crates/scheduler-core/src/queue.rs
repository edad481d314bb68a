//! Ordered store of pending runs awaiting admission.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::catalog::JobId;

/// The queue's ordering key: `(priority ASC, scheduled_for ASC, enqueued_at ASC, job_id ASC)`,
/// with `run_id` as a final tiebreaker so two entries are never considered equal.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub priority: i32,
    pub scheduled_for: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub job_id: JobId,
    pub run_id: Uuid,
    pub resource_group: String,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.run_id == other.run_id
    }
}
impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.scheduled_for.cmp(&other.scheduled_for))
            .then_with(|| self.enqueued_at.cmp(&other.enqueued_at))
            .then_with(|| self.job_id.cmp(&other.job_id))
            .then_with(|| self.run_id.cmp(&other.run_id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered set of pending runs. Admission scans in order and admits the
/// first run whose group currently has capacity, leaving all others in
/// place — a lower-priority run behind a blocked group does not starve a
/// later, admissible one.
#[derive(Default)]
pub struct RunQueue {
    entries: Mutex<BTreeSet<QueueEntry>>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: QueueEntry) {
        self.entries.lock().insert(entry);
    }

    /// Scan in order, admitting the first entry for which `admit_fn` (given
    /// the resource group name, scheduled time, and run id, so it can reserve
    /// the slot atomically as part of the check) returns `true`. Entries that
    /// fail admission are left in place for the next tick.
    pub fn pop_best_admissible(&self, admit_fn: impl Fn(&str, DateTime<Utc>, Uuid) -> bool) -> Option<QueueEntry> {
        let mut entries = self.entries.lock();
        let candidate = entries.iter().find(|e| admit_fn(&e.resource_group, e.scheduled_for, e.run_id)).cloned();
        if let Some(entry) = &candidate {
            entries.remove(entry);
        }
        candidate
    }

    pub fn remove(&self, run_id: Uuid) -> Option<QueueEntry> {
        let mut entries = self.entries.lock();
        let found = entries.iter().find(|e| e.run_id == run_id).cloned();
        if let Some(entry) = &found {
            entries.remove(entry);
        }
        found
    }

    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn contains_job(&self, job_id: &str) -> bool {
        self.entries.lock().iter().any(|e| e.job_id == job_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(priority: i32, job_id: &str, scheduled_for: DateTime<Utc>) -> QueueEntry {
        QueueEntry {
            priority,
            scheduled_for,
            enqueued_at: scheduled_for,
            job_id: job_id.to_string(),
            run_id: Uuid::new_v4(),
            resource_group: "G".to_string(),
        }
    }

    #[test]
    fn pops_in_priority_then_scheduled_for_then_job_id_order() {
        let queue = RunQueue::new();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        queue.push(entry(5, "b", t0));
        queue.push(entry(0, "a", t0));
        queue.push(entry(0, "a2", t0 + chrono::Duration::seconds(1)));

        let first = queue.pop_best_admissible(|_, _, _| true).unwrap();
        assert_eq!(first.job_id, "a");
        let second = queue.pop_best_admissible(|_, _, _| true).unwrap();
        assert_eq!(second.job_id, "a2");
        let third = queue.pop_best_admissible(|_, _, _| true).unwrap();
        assert_eq!(third.job_id, "b");
    }

    #[test]
    fn pop_best_admissible_skips_blocked_groups_without_removing_them() {
        let queue = RunQueue::new();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut blocked = entry(0, "a", t0);
        blocked.resource_group = "BLOCKED".to_string();
        let admissible = entry(1, "b", t0);
        queue.push(blocked);
        queue.push(admissible.clone());

        let popped = queue.pop_best_admissible(|g, _, _| g != "BLOCKED").unwrap();
        assert_eq!(popped.job_id, "b");
        assert_eq!(queue.len(), 1);
        assert!(queue.contains_job("a"));
    }

    #[test]
    fn remove_drops_a_specific_entry() {
        let queue = RunQueue::new();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let e = entry(0, "a", t0);
        let run_id = e.run_id;
        queue.push(e);
        assert!(queue.remove(run_id).is_some());
        assert!(queue.is_empty());
    }
}
