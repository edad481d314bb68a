//! Per-group concurrency accounting. One named pool per `resource_group`
//! string in the catalog; admission is a check-and-insert under the group's
//! own entry in a concurrent map.

use dashmap::DashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct GroupState {
    max_concurrent: u32,
    running_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct GroupSummary {
    pub name: String,
    pub running: u32,
    pub max: u32,
    pub available: u32,
    pub run_ids: Vec<Uuid>,
}

/// Tracks, per named resource group, the set of currently-running run ids
/// against that group's `max_concurrent` cap.
#[derive(Debug, Default)]
pub struct ResourceGroupTable {
    groups: DashMap<String, GroupState>,
}

impl ResourceGroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re-)declare a group's cap from the current catalog. Existing running
    /// ids survive a cap change; a lowered cap simply blocks new admissions
    /// until enough runs finish to come back under it.
    pub fn declare_group(&self, name: &str, max_concurrent: u32) {
        self.groups
            .entry(name.to_string())
            .and_modify(|g| g.max_concurrent = max_concurrent)
            .or_insert_with(|| GroupState {
                max_concurrent,
                running_ids: Vec::new(),
            });
    }

    /// Atomic check-and-insert: returns `true` and reserves a slot iff the
    /// group is under its cap.
    pub fn try_acquire(&self, group: &str, run_id: Uuid) -> bool {
        match self.groups.get_mut(group) {
            Some(mut state) => {
                if (state.running_ids.len() as u32) < state.max_concurrent {
                    state.running_ids.push(run_id);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Release a previously-acquired slot. A no-op if the group or the id is
    /// absent (idempotent, tolerant of double-release on shutdown races).
    pub fn release(&self, group: &str, run_id: Uuid) {
        if let Some(mut state) = self.groups.get_mut(group) {
            state.running_ids.retain(|id| *id != run_id);
        }
    }

    pub fn summary(&self, group: &str) -> Option<GroupSummary> {
        self.groups.get(group).map(|state| GroupSummary {
            name: group.to_string(),
            running: state.running_ids.len() as u32,
            max: state.max_concurrent,
            available: state.max_concurrent.saturating_sub(state.running_ids.len() as u32),
            run_ids: state.running_ids.clone(),
        })
    }

    pub fn all_summaries(&self) -> Vec<GroupSummary> {
        self.groups
            .iter()
            .map(|entry| GroupSummary {
                name: entry.key().clone(),
                running: entry.value().running_ids.len() as u32,
                max: entry.value().max_concurrent,
                available: entry.value().max_concurrent.saturating_sub(entry.value().running_ids.len() as u32),
                run_ids: entry.value().running_ids.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_respects_max_concurrent() {
        let table = ResourceGroupTable::new();
        table.declare_group("G", 1);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(table.try_acquire("G", a));
        assert!(!table.try_acquire("G", b));
        table.release("G", a);
        assert!(table.try_acquire("G", b));
    }

    #[test]
    fn unknown_group_never_admits() {
        let table = ResourceGroupTable::new();
        assert!(!table.try_acquire("ghost", Uuid::new_v4()));
    }

    #[test]
    fn summary_reports_running_and_available() {
        let table = ResourceGroupTable::new();
        table.declare_group("G", 3);
        let a = Uuid::new_v4();
        table.try_acquire("G", a);
        let summary = table.summary("G").unwrap();
        assert_eq!(summary.running, 1);
        assert_eq!(summary.max, 3);
        assert_eq!(summary.available, 2);
        assert_eq!(summary.run_ids, vec![a]);
    }

    #[test]
    fn release_is_idempotent() {
        let table = ResourceGroupTable::new();
        table.declare_group("G", 1);
        let a = Uuid::new_v4();
        table.try_acquire("G", a);
        table.release("G", a);
        table.release("G", a);
        assert_eq!(table.summary("G").unwrap().running, 0);
    }
}
