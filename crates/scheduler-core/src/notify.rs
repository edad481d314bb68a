//! Typed notification events, rate limiting, and dispatch to an injected
//! webhook sink. The sink trait lives here; the concrete HTTP transport
//! lives in the server crate, kept external to the engine.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::{Job, NotificationFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    RunSucceeded,
    RunFailed,
    KeywordHit,
    SchedulerStarted,
    SchedulerStopped,
    ModeChanged,
}

#[derive(Debug, Clone)]
pub enum NotificationEvent {
    RunStarted { job_id: String, run_id: Uuid },
    RunSucceeded { job_id: String, run_id: Uuid },
    RunFailed { job_id: String, run_id: Uuid, reason: String },
    KeywordHit { job_id: String, run_id: Uuid, message: String },
    SchedulerStarted,
    SchedulerStopped,
    ModeChanged { mode: String },
}

impl NotificationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            NotificationEvent::RunStarted { .. } => EventKind::RunStarted,
            NotificationEvent::RunSucceeded { .. } => EventKind::RunSucceeded,
            NotificationEvent::RunFailed { .. } => EventKind::RunFailed,
            NotificationEvent::KeywordHit { .. } => EventKind::KeywordHit,
            NotificationEvent::SchedulerStarted => EventKind::SchedulerStarted,
            NotificationEvent::SchedulerStopped => EventKind::SchedulerStopped,
            NotificationEvent::ModeChanged { .. } => EventKind::ModeChanged,
        }
    }

    /// Whether `flags` authorizes dispatching this event for its job.
    /// Scheduler-wide events (no associated job) are always enabled.
    fn permitted_by(&self, flags: &NotificationFlags) -> bool {
        match self.kind() {
            EventKind::RunStarted => flags.notify_on_start,
            EventKind::RunSucceeded => flags.notify_on_success,
            EventKind::RunFailed => flags.notify_on_failure,
            EventKind::KeywordHit => flags.notify_on_keyword,
            EventKind::SchedulerStarted | EventKind::SchedulerStopped | EventKind::ModeChanged => true,
        }
    }

    fn job_id(&self) -> Option<&str> {
        match self {
            NotificationEvent::RunStarted { job_id, .. }
            | NotificationEvent::RunSucceeded { job_id, .. }
            | NotificationEvent::RunFailed { job_id, .. }
            | NotificationEvent::KeywordHit { job_id, .. } => Some(job_id),
            NotificationEvent::SchedulerStarted | NotificationEvent::SchedulerStopped | NotificationEvent::ModeChanged { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub payload_template_id: String,
    pub variables: HashMap<String, String>,
}

/// Abstract webhook transport. The concrete implementation is external to
/// the engine; the engine only ever calls through this trait.
#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn deliver(&self, payload: NotificationPayload) -> Result<(), String>;
}

/// A sink that records nothing and always succeeds; useful for tests and as
/// the default when no webhook is configured.
pub struct NullWebhookSink;

#[async_trait]
impl WebhookSink for NullWebhookSink {
    async fn deliver(&self, _payload: NotificationPayload) -> Result<(), String> {
        Ok(())
    }
}

struct RateWindow {
    window_start: DateTime<Utc>,
    count: u32,
    overflow: u32,
}

/// Formats and dispatches notification events, applying per-`(job_id, event_kind)`
/// rate limiting with an overflow summary on window close.
pub struct Notifier {
    sink: Box<dyn WebhookSink>,
    max_per_window: u32,
    window: Duration,
    windows: Mutex<HashMap<(String, EventKind), RateWindow>>,
}

impl Notifier {
    pub fn new(sink: Box<dyn WebhookSink>) -> Self {
        Self::with_rate_limit(sink, 5, Duration::from_secs(60))
    }

    pub fn with_rate_limit(sink: Box<dyn WebhookSink>, max_per_window: u32, window: Duration) -> Self {
        Self {
            sink,
            max_per_window,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatch `event` for `job`, subject to its notification flags and the
    /// rate limiter. `job` is `None` for scheduler-wide events.
    pub async fn notify(&self, event: NotificationEvent, job: Option<&Job>, now: DateTime<Utc>) {
        if let Some(job) = job {
            if !event.permitted_by(&job.notifications) {
                return;
            }
        }

        let key = (event.job_id().unwrap_or("__scheduler__").to_string(), event.kind());
        let should_send = {
            let mut windows = self.windows.lock();
            let entry = windows.entry(key.clone()).or_insert_with(|| RateWindow {
                window_start: now,
                count: 0,
                overflow: 0,
            });
            if now.signed_duration_since(entry.window_start).to_std().unwrap_or(Duration::ZERO) >= self.window {
                let had_overflow = entry.overflow;
                entry.window_start = now;
                entry.count = 0;
                entry.overflow = 0;
                if had_overflow > 0 {
                    tracing::info!(job_id = %key.0, kind = ?key.1, had_overflow, "notification window closed with overflow");
                }
            }
            if entry.count < self.max_per_window {
                entry.count += 1;
                true
            } else {
                entry.overflow += 1;
                false
            }
        };

        if !should_send {
            return;
        }

        let payload = payload_for(&event);
        if let Err(err) = self.sink.deliver(payload).await {
            tracing::warn!(error = %err, kind = ?event.kind(), "notification delivery failed");
        }
    }

    /// Deliver `payload` straight through the sink, bypassing rate limiting
    /// and job notification flags. Used for `POST /api/test-notification`,
    /// where the operator explicitly asked for one delivery.
    pub async fn send_raw(&self, payload: NotificationPayload) {
        if let Err(err) = self.sink.deliver(payload).await {
            tracing::warn!(error = %err, "test notification delivery failed");
        }
    }
}

fn payload_for(event: &NotificationEvent) -> NotificationPayload {
    let mut variables = HashMap::new();
    let template_id = match event {
        NotificationEvent::RunStarted { job_id, run_id } => {
            variables.insert("job_id".to_string(), job_id.clone());
            variables.insert("run_id".to_string(), run_id.to_string());
            "run_started"
        }
        NotificationEvent::RunSucceeded { job_id, run_id } => {
            variables.insert("job_id".to_string(), job_id.clone());
            variables.insert("run_id".to_string(), run_id.to_string());
            "run_succeeded"
        }
        NotificationEvent::RunFailed { job_id, run_id, reason } => {
            variables.insert("job_id".to_string(), job_id.clone());
            variables.insert("run_id".to_string(), run_id.to_string());
            variables.insert("reason".to_string(), reason.clone());
            "run_failed"
        }
        NotificationEvent::KeywordHit { job_id, run_id, message } => {
            variables.insert("job_id".to_string(), job_id.clone());
            variables.insert("run_id".to_string(), run_id.to_string());
            variables.insert("message".to_string(), message.clone());
            "keyword_hit"
        }
        NotificationEvent::SchedulerStarted => "scheduler_started",
        NotificationEvent::SchedulerStopped => "scheduler_stopped",
        NotificationEvent::ModeChanged { mode } => {
            variables.insert("mode".to_string(), mode.clone());
            "mode_changed"
        }
    };
    NotificationPayload {
        payload_template_id: template_id.to_string(),
        variables,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink(Arc<AtomicUsize>);

    #[async_trait]
    impl WebhookSink for CountingSink {
        async fn deliver(&self, _payload: NotificationPayload) -> Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn job_with_flags(flags: NotificationFlags) -> Job {
        use crate::trigger::Trigger;
        Job::builder()
            .id("j".to_string())
            .name("j".to_string())
            .priority(0)
            .resource_group("G".to_string())
            .trigger(Trigger::Interval { spec: "5m".to_string() })
            .steps(vec![])
            .notifications(flags)
            .build()
    }

    #[tokio::test]
    async fn event_suppressed_when_flag_disabled() {
        let count = Arc::new(AtomicUsize::new(0));
        let notifier = Notifier::new(Box::new(CountingSink(count.clone())));
        let job = job_with_flags(NotificationFlags::default());
        notifier
            .notify(
                NotificationEvent::RunStarted { job_id: "j".to_string(), run_id: Uuid::new_v4() },
                Some(&job),
                Utc::now(),
            )
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn event_delivered_when_flag_enabled() {
        let count = Arc::new(AtomicUsize::new(0));
        let notifier = Notifier::new(Box::new(CountingSink(count.clone())));
        let mut flags = NotificationFlags::default();
        flags.notify_on_start = true;
        let job = job_with_flags(flags);
        notifier
            .notify(
                NotificationEvent::RunStarted { job_id: "j".to_string(), run_id: Uuid::new_v4() },
                Some(&job),
                Utc::now(),
            )
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limit_caps_deliveries_per_window() {
        let count = Arc::new(AtomicUsize::new(0));
        let notifier = Notifier::with_rate_limit(Box::new(CountingSink(count.clone())), 2, Duration::from_secs(60));
        let mut flags = NotificationFlags::default();
        flags.notify_on_start = true;
        let job = job_with_flags(flags);
        let now = Utc::now();
        for _ in 0..5 {
            notifier
                .notify(
                    NotificationEvent::RunStarted { job_id: "j".to_string(), run_id: Uuid::new_v4() },
                    Some(&job),
                    now,
                )
                .await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn scheduler_wide_events_ignore_flags() {
        let count = Arc::new(AtomicUsize::new(0));
        let notifier = Notifier::new(Box::new(CountingSink(count.clone())));
        notifier.notify(NotificationEvent::SchedulerStarted, None, Utc::now()).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
