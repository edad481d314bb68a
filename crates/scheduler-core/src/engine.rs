//! The scheduler loop: ticks, asks the trigger evaluator for due jobs,
//! admits pending runs under resource-group caps, launches subprocesses via
//! the supervisor, and reacts to keyword/retry/notification side effects.
//! Also hosts the control API's engine-side operations: manual run, cancel,
//! start/stop, mode.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{Catalog, Job, JobId, ResourceGroupSpec};
use crate::clock::Clock;
use crate::error::EngineResult;
use crate::mode::Mode;
use crate::notify::{NotificationEvent, NotificationPayload, Notifier};
use crate::queue::{QueueEntry, RunQueue};
use crate::resource_group::{GroupSummary, ResourceGroupTable};
use crate::retry_engine;
use crate::run::{FinishReason, Run, RunOrigin, RunStatus, RunStore};
use crate::supervisor::{OutputLine, Supervisor, SupervisorOutcome};
use crate::trigger::{self, OsRng};

/// Default tick cadence.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000);

/// Priority assigned to manual runs: below the declarable `-100..=100` range,
/// so a manual run always sorts ahead of every scheduler-origin entry.
pub const MANUAL_RUN_PRIORITY: i32 = i32::MIN;

/// Grace period the supervisor's kill escalation uses, and the same window
/// `stop()` waits for running runs to exit before returning.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("unknown job {0:?}")]
    UnknownJob(JobId),
    #[error("unknown run {0}")]
    UnknownRun(Uuid),
    #[error("manual run refused: stop the scheduler or switch to single-task mode")]
    ManualRunBlockedByAuto,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSummary {
    pub running: bool,
    pub mode: Mode,
    pub total_jobs: usize,
    pub running_runs: usize,
    pub queue_depth: usize,
}

struct FinishedRun {
    job_id: JobId,
    outcome: SupervisorOutcome,
}

/// Process-wide engine instance, explicitly constructed rather than a global
/// singleton; tests build their own isolated `Engine`s with a `FakeClock`.
pub struct Engine {
    clock: Arc<dyn Clock>,
    catalog: RwLock<Arc<Catalog>>,
    groups: ResourceGroupTable,
    queue: RunQueue,
    store: RunStore,
    notifier: Notifier,
    mode: RwLock<Mode>,
    ticking: AtomicBool,
    wake: Notify,
    /// The next fire already computed for a job but not yet due; avoids
    /// recomputing (and, for `RandomWindow`, re-rolling) on every tick.
    next_fire_cache: DashMap<JobId, DateTime<Utc>>,
    /// The wall time of the most recent fire actually turned into a run,
    /// seeding `Interval`/`RandomWindow` continuation.
    last_fire: DashMap<JobId, DateTime<Utc>>,
    run_cancels: DashMap<Uuid, CancellationToken>,
    finished_tx: mpsc::UnboundedSender<FinishedRun>,
    finished_rx: AsyncMutex<mpsc::UnboundedReceiver<FinishedRun>>,
    lines_tx: mpsc::UnboundedSender<OutputLine>,
}

impl Engine {
    pub fn new(clock: Arc<dyn Clock>, catalog: Catalog, notifier: Notifier) -> Arc<Self> {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let (lines_tx, mut lines_rx) = mpsc::unbounded_channel::<OutputLine>();

        let engine = Arc::new(Self {
            clock,
            catalog: RwLock::new(Arc::new(catalog)),
            groups: ResourceGroupTable::new(),
            queue: RunQueue::new(),
            store: RunStore::new(),
            notifier,
            mode: RwLock::new(Mode::Auto),
            ticking: AtomicBool::new(false),
            wake: Notify::new(),
            next_fire_cache: DashMap::new(),
            last_fire: DashMap::new(),
            run_cancels: DashMap::new(),
            finished_tx,
            finished_rx: AsyncMutex::new(finished_rx),
            lines_tx,
        });

        engine.sync_groups(&engine.catalog.read().clone());

        let sink = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Some(line) = lines_rx.recv().await {
                sink.store.append_line(line.run_id, line.line.clone());
                sink.store.push_event(format!("[{}] {}", line.run_id, line.line));
            }
        });

        engine
    }

    fn sync_groups(&self, catalog: &Catalog) {
        for group in catalog.resource_groups() {
            self.groups.declare_group(&group.name, group.max_concurrent);
        }
    }

    /// Publish a new catalog version. Readers (including an in-flight tick)
    /// keep using the snapshot they already hold; the next tick observes the
    /// swap.
    pub fn set_catalog(&self, catalog: Catalog) {
        self.sync_groups(&catalog);
        *self.catalog.write() = Arc::new(catalog);
        self.wake.notify_one();
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog.read().clone()
    }

    /// Validate `jobs`/`resource_groups` and publish them as the new catalog
    /// in one step, for callers (the Control API's create/update/delete
    /// handlers) that build a candidate catalog from raw parts rather than
    /// an already-validated one.
    pub fn publish_catalog(&self, jobs: Vec<Job>, resource_groups: Vec<ResourceGroupSpec>) -> EngineResult<()> {
        let catalog = Catalog::new(jobs, resource_groups)?;
        self.set_catalog(catalog);
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        *self.mode.read()
    }

    pub fn is_running(&self) -> bool {
        self.ticking.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> StatusSummary {
        StatusSummary {
            running: self.is_running(),
            mode: self.mode(),
            total_jobs: self.catalog().jobs().count(),
            running_runs: self.store.running_run_ids().len(),
            queue_depth: self.queue.len(),
        }
    }

    pub fn resource_group_summaries(&self) -> Vec<GroupSummary> {
        self.groups.all_summaries()
    }

    pub fn run(&self, run_id: Uuid) -> Option<Run> {
        self.store.get(run_id)
    }

    pub fn live_run_for_job(&self, job_id: &str) -> Option<Run> {
        self.store.live_run_for_job(job_id)
    }

    pub fn latest_run_for_job(&self, job_id: &str) -> Option<Run> {
        self.store.latest_live_or_recent_for_job(job_id)
    }

    pub fn terminal_history(&self, job_id: &str) -> Vec<Run> {
        self.store.terminal_history(job_id)
    }

    pub fn recent_events(&self) -> Vec<String> {
        self.store.recent_events()
    }

    /// Start tick processing. A no-op if already running.
    pub async fn start(&self) {
        if !self.ticking.swap(true, Ordering::SeqCst) {
            info!("scheduler starting");
            self.notifier.notify(NotificationEvent::SchedulerStarted, None, self.clock.now()).await;
            self.wake.notify_one();
        }
    }

    /// Stop tick processing: cancel every pending run, signal every running
    /// run to stop, and wait up to `STOP_GRACE_PERIOD` for them to exit.
    pub async fn stop(&self) {
        if !self.ticking.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("scheduler stopping");

        let now = self.clock.now();
        for run_id in self.queue.snapshot().into_iter().map(|e| e.run_id) {
            if let Some(entry) = self.queue.remove(run_id) {
                self.store.remove_pending_as(entry.run_id, RunStatus::Cancelled, now);
            }
        }

        for run_id in self.store.running_run_ids() {
            self.cancel_running(run_id);
        }

        let deadline = tokio::time::Instant::now() + STOP_GRACE_PERIOD;
        while tokio::time::Instant::now() < deadline && !self.store.running_run_ids().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.drain_finished().await;
        }

        self.notifier.notify(NotificationEvent::SchedulerStopped, None, self.clock.now()).await;
    }

    /// AUTO <-> SINGLE. Transitioning into SINGLE leaves any currently
    /// running run alone but marks every other `pending` run `preempted`
    /// and blocks further admission until the single slot is free.
    pub async fn set_mode(&self, mode: Mode) {
        let previous = {
            let mut guard = self.mode.write();
            let previous = *guard;
            *guard = mode;
            previous
        };
        if previous == mode {
            return;
        }

        if mode == Mode::Single {
            let now = self.clock.now();
            for entry in self.queue.snapshot() {
                if self.queue.remove(entry.run_id).is_some() {
                    self.store.remove_pending_as(entry.run_id, RunStatus::Preempted, now);
                }
            }
        }

        self.notifier
            .notify(NotificationEvent::ModeChanged { mode: mode.to_string() }, None, self.clock.now())
            .await;
        self.wake.notify_one();
    }

    /// Create a manual run for `job_id`, boosted to the highest priority and
    /// pushed immediately, still subject to group admission. Refused when
    /// mode is AUTO and the scheduler loop is running.
    pub fn manual_run(&self, job_id: &str) -> Result<Uuid, ControlError> {
        if self.mode() == Mode::Auto && self.is_running() {
            return Err(ControlError::ManualRunBlockedByAuto);
        }
        let catalog = self.catalog();
        let job = catalog.job(job_id).ok_or_else(|| ControlError::UnknownJob(job_id.to_string()))?;

        let now = self.clock.now();
        let run = Run::new_pending(job.id.clone(), job.resource_group.clone(), RunOrigin::Manual, 1, now, now, None);
        let run_id = run.run_id;
        self.store.insert_pending(run);
        self.queue.push(QueueEntry {
            priority: MANUAL_RUN_PRIORITY,
            scheduled_for: now,
            enqueued_at: now,
            job_id: job.id.clone(),
            run_id,
            resource_group: job.resource_group.clone(),
        });
        self.wake.notify_one();
        Ok(run_id)
    }

    /// Dispatch a synthetic notification straight through the configured
    /// sink, bypassing rate limiting.
    pub async fn test_notification(&self, payload_template_id: String) {
        self.notifier
            .send_raw(NotificationPayload { payload_template_id, variables: Default::default() })
            .await;
    }

    /// Cancel a run. Idempotent for an already-terminal run.
    pub fn cancel_run(&self, run_id: Uuid) -> Result<(), ControlError> {
        let Some(run) = self.store.get(run_id) else {
            return Err(ControlError::UnknownRun(run_id));
        };
        match run.status {
            RunStatus::Pending => {
                self.queue.remove(run_id);
                self.store.remove_pending_as(run_id, RunStatus::Cancelled, self.clock.now());
            }
            RunStatus::Running => self.cancel_running(run_id),
            _ => {}
        }
        Ok(())
    }

    /// Cancel the latest live run for a job.
    pub fn cancel_latest_for_job(&self, job_id: &str) -> Result<(), ControlError> {
        let run = self
            .store
            .live_run_for_job(job_id)
            .ok_or_else(|| ControlError::UnknownJob(job_id.to_string()))?;
        self.cancel_run(run.run_id)
    }

    fn cancel_running(&self, run_id: Uuid) {
        if let Some((_, token)) = self.run_cancels.remove(&run_id) {
            token.cancel();
        }
    }

    /// Run one tick of the scheduler loop to completion: catalog sync is
    /// implicit (reads always see the latest published snapshot), due-run
    /// planning, admission, and reaping.
    pub async fn tick(self: &Arc<Self>) {
        if !self.is_running() {
            self.drain_finished().await;
            return;
        }

        let catalog = self.catalog();
        let now = self.clock.now();

        self.plan_due_runs(&catalog, now);
        self.admit(&catalog, now);
        self.drain_finished().await;
    }

    fn plan_due_runs(&self, catalog: &Catalog, now: DateTime<Utc>) {
        for job in catalog.jobs() {
            if !job.enabled {
                continue;
            }
            if self.store.has_live_run(&job.id) {
                continue;
            }

            let cached = self.next_fire_cache.get(&job.id).map(|v| *v);
            let next_fire = match cached {
                Some(t) => Some(t),
                None => {
                    let mut rng = OsRng;
                    match trigger::next_fire(&job.trigger, now, self.last_fire.get(&job.id).map(|v| *v), &mut rng) {
                        Ok(next) => {
                            if let Some(t) = next {
                                self.next_fire_cache.insert(job.id.clone(), t);
                            }
                            next
                        }
                        Err(e) => {
                            warn!(job_id = %job.id, error = %e, "trigger evaluation failed");
                            None
                        }
                    }
                }
            };

            let Some(fire_at) = next_fire else { continue };
            if fire_at > now {
                continue;
            }

            self.next_fire_cache.remove(&job.id);
            self.last_fire.insert(job.id.clone(), fire_at);

            let run = Run::new_pending(job.id.clone(), job.resource_group.clone(), RunOrigin::Scheduler, 1, fire_at, now, None);
            let run_id = run.run_id;
            self.store.insert_pending(run);
            self.queue.push(QueueEntry {
                priority: job.priority,
                scheduled_for: fire_at,
                enqueued_at: now,
                job_id: job.id.clone(),
                run_id,
                resource_group: job.resource_group.clone(),
            });
            debug!(job_id = %job.id, run_id = %run_id, scheduled_for = %fire_at, "due run enqueued");
        }
    }

    fn admit(self: &Arc<Self>, catalog: &Catalog, now: DateTime<Utc>) {
        loop {
            let mode = self.mode();
            let single_slot_free = self.store.running_run_ids().is_empty();
            let groups = &self.groups;
            let popped = self.queue.pop_best_admissible(|group, scheduled_for, run_id| {
                if scheduled_for > now {
                    return false;
                }
                if mode == Mode::Single && !single_slot_free {
                    return false;
                }
                groups.try_acquire(group, run_id)
            });
            let Some(entry) = popped else { break };

            let Some(job) = catalog.job(&entry.job_id).cloned() else {
                // Job removed from the catalog between enqueue and admission.
                self.groups.release(&entry.resource_group, entry.run_id);
                self.store.remove_pending_as(entry.run_id, RunStatus::Cancelled, now);
                continue;
            };

            self.store.mark_running(entry.run_id, now);
            let run_id = entry.run_id;
            let job_id = job.id.clone();
            info!(job_id = %job_id, run_id = %run_id, "run admitted");

            let notifier_job = job.clone();
            let this = Arc::clone(self);
            let notify_now = now;
            tokio::spawn(async move {
                this.notifier.notify(NotificationEvent::RunStarted { job_id: job_id.clone(), run_id }, Some(&notifier_job), notify_now).await;
            });

            let cancel = CancellationToken::new();
            self.run_cancels.insert(run_id, cancel.clone());

            let supervisor = Supervisor::new(self.lines_tx.clone());
            let finished_tx = self.finished_tx.clone();
            let exec_job_id = job.id.clone();
            tokio::spawn(async move {
                let outcome = supervisor.execute(run_id, &job, cancel).await;
                let _ = finished_tx.send(FinishedRun { job_id: exec_job_id, outcome });
            });
        }
    }

    async fn drain_finished(self: &Arc<Self>) {
        let mut rx = self.finished_rx.lock().await;
        while let Ok(finished) = rx.try_recv() {
            self.reap(finished).await;
        }
    }

    async fn reap(self: &Arc<Self>, finished: FinishedRun) {
        let FinishedRun { job_id, outcome } = finished;
        let run_id = outcome.run_id;

        let Some(run_before) = self.store.get(run_id) else { return };
        self.groups.release(&run_before.resource_group, run_id);
        self.run_cancels.remove(&run_id);

        for message in &outcome.keyword_hits {
            self.store.record_keyword_hit(run_id, message.clone());
        }

        let now = self.clock.now();
        let status = match outcome.reason {
            FinishReason::Cancel => RunStatus::Cancelled,
            FinishReason::Exit => {
                if outcome.exit_code == Some(0) {
                    RunStatus::Completed
                } else {
                    RunStatus::Failed
                }
            }
            FinishReason::Timeout | FinishReason::Spawn | FinishReason::Keyword | FinishReason::Prelude | FinishReason::Signal => {
                RunStatus::Failed
            }
        };

        let Some(finished_run) = self.store.finish(run_id, status, outcome.reason, outcome.exit_code, now) else {
            return;
        };

        if finished_run.origin == RunOrigin::Scheduler {
            self.last_fire.insert(job_id.clone(), finished_run.scheduled_for);
        }

        let catalog = self.catalog();
        let job = catalog.job(&job_id).cloned();

        match status {
            RunStatus::Completed => {
                if let Some(job) = &job {
                    self.notifier.notify(NotificationEvent::RunSucceeded { job_id: job_id.clone(), run_id }, Some(job), now).await;
                }
            }
            RunStatus::Failed => {
                if let Some(job) = &job {
                    let reason = format!("{:?}", finished_run.finish_reason);
                    self.notifier.notify(NotificationEvent::RunFailed { job_id: job_id.clone(), run_id, reason }, Some(job), now).await;
                }
            }
            _ => {}
        }

        if let Some(job) = &job {
            for message in &finished_run.keyword_hits {
                self.notifier
                    .notify(NotificationEvent::KeywordHit { job_id: job_id.clone(), run_id, message: message.clone() }, Some(job), now)
                    .await;
            }

            if let Some(followup) = retry_engine::on_terminal(job, &finished_run, now) {
                let new_run = Run::new_pending(
                    job.id.clone(),
                    job.resource_group.clone(),
                    followup.origin,
                    followup.attempt,
                    followup.scheduled_for,
                    now,
                    followup.window_origin_fire,
                );
                let mut new_run = new_run;
                new_run.success_repeat_count = followup.success_repeat_count;
                let new_run_id = new_run.run_id;
                self.store.insert_pending(new_run);
                self.queue.push(QueueEntry {
                    priority: job.priority,
                    scheduled_for: followup.scheduled_for,
                    enqueued_at: now,
                    job_id: job.id.clone(),
                    run_id: new_run_id,
                    resource_group: job.resource_group.clone(),
                });
                info!(job_id = %job.id, run_id = %new_run_id, origin = ?followup.origin, "follow-up run scheduled");
            }
        } else {
            self.store.push_event(format!("job {job_id} removed from catalog before follow-up could be scheduled"));
        }
    }

    /// Spawn the scheduler loop as a background task, ticking on `interval`
    /// and on `set_catalog`/control-API wake calls, until `shutdown` fires
    /// (mirrors the corpus's "suspend on tick timer and a wake channel").
    pub fn spawn_loop(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = engine.wake.notified() => {}
                }
                // Loop-internal panics are caught at this boundary, logged,
                // and the loop continues on the next tick:
                // each tick runs in its own task so a panic surfaces as a
                // `JoinError` instead of unwinding the loop.
                let tick_engine = Arc::clone(&engine);
                if let Err(join_err) = tokio::spawn(async move { tick_engine.tick().await }).await {
                    warn!(error = %join_err, "scheduler tick panicked; continuing on next tick");
                }
            }
        })
    }
}
