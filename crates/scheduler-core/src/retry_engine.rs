//! Decides whether a finished run yields a follow-up run: failure retry or
//! in-window success repeat.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::catalog::Job;
use crate::run::{Run, RunOrigin, RunStatus};

/// A follow-up run to enqueue, or `None` if the chain/window is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowUp {
    pub origin: RunOrigin,
    pub attempt: u32,
    pub scheduled_for: DateTime<Utc>,
    pub window_origin_fire: Option<DateTime<Utc>>,
    pub success_repeat_count: u32,
}

/// Inspect a just-terminated `run` of `job` and decide on a follow-up.
/// `now` is the terminal transition's wall time.
pub fn on_terminal(job: &Job, run: &Run, now: DateTime<Utc>) -> Option<FollowUp> {
    match run.status {
        RunStatus::Failed => failure_retry(job, run, now),
        RunStatus::Completed => success_repeat(job, run, now),
        _ => None,
    }
}

fn failure_retry(job: &Job, run: &Run, now: DateTime<Utc>) -> Option<FollowUp> {
    if run.attempt >= job.retry.max_failure_retries {
        return None;
    }
    Some(FollowUp {
        origin: RunOrigin::FailureRetry,
        attempt: run.attempt + 1,
        scheduled_for: now + ChronoDuration::seconds(job.retry.failure_retry_delay_seconds as i64),
        window_origin_fire: run.window_origin_fire,
        success_repeat_count: 0,
    })
}

fn success_repeat(job: &Job, run: &Run, now: DateTime<Utc>) -> Option<FollowUp> {
    if !job.retry.success_repeat_within_window {
        return None;
    }
    if !crate::trigger::is_window_bearing(&job.trigger) {
        return None;
    }

    let origin_fire = run.window_origin_fire.unwrap_or(run.scheduled_for);
    let window_end = job.window_end(origin_fire)?;

    let next_fire = now + ChronoDuration::seconds(job.retry.success_repeat_delay_seconds as i64);
    if next_fire > window_end {
        return None;
    }

    let next_count = run.success_repeat_count + 1;
    if next_count > job.retry.success_repeat_max {
        return None;
    }

    Some(FollowUp {
        origin: RunOrigin::SuccessRepeat,
        attempt: run.attempt + 1,
        scheduled_for: next_fire,
        window_origin_fire: Some(origin_fire),
        success_repeat_count: next_count,
    })
}
