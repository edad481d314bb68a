//! Run records and the in-memory store that owns them. The scheduler loop
//! and supervisor reference runs by id only; this module is their sole
//! owner.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOrigin {
    Scheduler,
    Manual,
    FailureRetry,
    SuccessRepeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Preempted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Exit,
    Timeout,
    Cancel,
    Signal,
    Prelude,
    Keyword,
    Spawn,
}

/// A fixed-capacity FIFO buffer; pushing past capacity drops the oldest entry.
#[derive(Debug, Clone, Default)]
pub struct RingBuffer<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Serialize> Serialize for RingBuffer<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.items.iter())
    }
}

pub const DEFAULT_LAST_LINES_CAPACITY: usize = 1000;
pub const DEFAULT_TERMINAL_HISTORY_PER_JOB: usize = 20;
pub const DEFAULT_GLOBAL_EVENT_HISTORY: usize = 2000;

#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub run_id: Uuid,
    pub job_id: JobId,
    pub resource_group: String,
    pub origin: RunOrigin,
    /// 1-indexed within this origin's retry/repeat chain.
    pub attempt: u32,
    pub scheduled_for: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub status: RunStatus,
    pub finish_reason: Option<FinishReason>,
    pub keyword_hits: Vec<String>,
    pub last_lines: RingBuffer<String>,
    /// For success-repeat chains: the wall time of the fire that opened the window.
    pub window_origin_fire: Option<DateTime<Utc>>,
    /// Number of success-repeats already scheduled within the current window.
    pub success_repeat_count: u32,
}

impl Run {
    pub fn new_pending(
        job_id: JobId,
        resource_group: String,
        origin: RunOrigin,
        attempt: u32,
        scheduled_for: DateTime<Utc>,
        enqueued_at: DateTime<Utc>,
        window_origin_fire: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job_id,
            resource_group,
            origin,
            attempt,
            scheduled_for,
            enqueued_at,
            started_at: None,
            finished_at: None,
            exit_code: None,
            status: RunStatus::Pending,
            finish_reason: None,
            keyword_hits: Vec::new(),
            last_lines: RingBuffer::new(DEFAULT_LAST_LINES_CAPACITY),
            window_origin_fire,
            success_repeat_count: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.status, RunStatus::Pending | RunStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }
}

/// In-memory table of all live runs and a bounded terminal history per job,
/// plus a global recent-events ring.
pub struct RunStore {
    inner: Mutex<RunStoreInner>,
    terminal_history_per_job: usize,
}

struct RunStoreInner {
    live: HashMap<Uuid, Run>,
    terminal_by_job: HashMap<JobId, RingBuffer<Run>>,
    global_events: RingBuffer<String>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::with_history_limits(DEFAULT_TERMINAL_HISTORY_PER_JOB, DEFAULT_GLOBAL_EVENT_HISTORY)
    }

    pub fn with_history_limits(terminal_history_per_job: usize, global_event_history: usize) -> Self {
        Self {
            inner: Mutex::new(RunStoreInner {
                live: HashMap::new(),
                terminal_by_job: HashMap::new(),
                global_events: RingBuffer::new(global_event_history),
            }),
            terminal_history_per_job,
        }
    }

    pub fn insert_pending(&self, run: Run) {
        let mut inner = self.inner.lock();
        inner.live.insert(run.run_id, run);
    }

    pub fn get(&self, run_id: Uuid) -> Option<Run> {
        self.inner.lock().live.get(&run_id).cloned()
    }

    /// True if `job_id` currently has a run in `pending` or `running`.
    pub fn has_live_run(&self, job_id: &str) -> bool {
        self.inner.lock().live.values().any(|r| r.job_id == job_id && r.is_live())
    }

    pub fn live_run_for_job(&self, job_id: &str) -> Option<Run> {
        self.inner.lock().live.values().find(|r| r.job_id == job_id).cloned()
    }

    pub fn latest_live_or_recent_for_job(&self, job_id: &str) -> Option<Run> {
        let inner = self.inner.lock();
        if let Some(run) = inner.live.values().find(|r| r.job_id == job_id) {
            return Some(run.clone());
        }
        inner
            .terminal_by_job
            .get(job_id)
            .and_then(|ring| ring.iter().last().cloned())
    }

    pub fn mark_running(&self, run_id: Uuid, started_at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        if let Some(run) = inner.live.get_mut(&run_id) {
            run.status = RunStatus::Running;
            run.started_at = Some(started_at);
        }
    }

    pub fn append_line(&self, run_id: Uuid, line: String) {
        let mut inner = self.inner.lock();
        if let Some(run) = inner.live.get_mut(&run_id) {
            run.last_lines.push(line);
        }
    }

    pub fn record_keyword_hit(&self, run_id: Uuid, message: String) {
        let mut inner = self.inner.lock();
        if let Some(run) = inner.live.get_mut(&run_id) {
            run.keyword_hits.push(message);
        }
    }

    /// Move a run from `live` to terminal history. Returns the finished run.
    pub fn finish(
        &self,
        run_id: Uuid,
        status: RunStatus,
        reason: FinishReason,
        exit_code: Option<i32>,
        finished_at: DateTime<Utc>,
    ) -> Option<Run> {
        let mut inner = self.inner.lock();
        let mut run = inner.live.remove(&run_id)?;
        run.status = status;
        run.finish_reason = Some(reason);
        run.exit_code = exit_code;
        run.finished_at = Some(finished_at);
        let job_id = run.job_id.clone();
        inner
            .terminal_by_job
            .entry(job_id)
            .or_insert_with(|| RingBuffer::new(self.terminal_history_per_job))
            .push(run.clone());
        Some(run)
    }

    /// Mark a `pending` run cancelled/preempted without ever having started.
    pub fn remove_pending_as(&self, run_id: Uuid, status: RunStatus, finished_at: DateTime<Utc>) -> Option<Run> {
        let mut inner = self.inner.lock();
        let run = inner.live.get(&run_id)?;
        if run.status != RunStatus::Pending {
            return None;
        }
        drop(inner);
        self.finish(run_id, status, FinishReason::Cancel, None, finished_at)
    }

    pub fn push_event(&self, event: String) {
        self.inner.lock().global_events.push(event);
    }

    pub fn recent_events(&self) -> Vec<String> {
        self.inner.lock().global_events.to_vec()
    }

    pub fn live_runs(&self) -> Vec<Run> {
        self.inner.lock().live.values().cloned().collect()
    }

    pub fn pending_run_ids(&self) -> Vec<Uuid> {
        self.inner
            .lock()
            .live
            .values()
            .filter(|r| r.status == RunStatus::Pending)
            .map(|r| r.run_id)
            .collect()
    }

    pub fn running_run_ids(&self) -> Vec<Uuid> {
        self.inner
            .lock()
            .live
            .values()
            .filter(|r| r.status == RunStatus::Running)
            .map(|r| r.run_id)
            .collect()
    }

    pub fn terminal_history(&self, job_id: &str) -> Vec<Run> {
        self.inner
            .lock()
            .terminal_by_job
            .get(job_id)
            .map(|ring| ring.to_vec())
            .unwrap_or_default()
    }
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new()
    }
}
