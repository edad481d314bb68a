//! Pure trigger evaluation: given a trigger spec and a reference time, compute
//! the next fire time (or "never"). No side effects, no clock reads — the
//! caller supplies `now`.

use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A bounded wall-clock interval during which scheduled-trigger jobs may
/// legally run; also bounds success-repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// The rule that determines when a job's next run should fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Standard five-field cron expression over minute/hour/day-of-month/month/day-of-week.
    Cron {
        expression: String,
        #[serde(default)]
        timezone: Option<String>,
    },
    /// Fixed interval, parsed from a suffixed integer (`s`/`m`/`h`, e.g. `9.5h`).
    Interval { spec: String },
    /// Uniform random pick within a daily wall-clock window.
    RandomWindow {
        window: TimeWindow,
        #[serde(default)]
        timezone: Option<String>,
    },
    /// Least future instant matching a day-of-week and time of day.
    Weekly {
        weekday: Weekday,
        time: NaiveTime,
        #[serde(default)]
        timezone: Option<String>,
    },
    /// Least future instant matching a day-of-month and time of day.
    Monthly {
        day_of_month: u32,
        time: NaiveTime,
        #[serde(default)]
        timezone: Option<String>,
    },
    /// A single absolute instant. "Never" once it is in the past.
    SpecificDate { at: DateTime<Utc> },
}

/// Source of uniform randomness for [`Trigger::RandomWindow`]. A trait so
/// tests can inject a deterministic sequence instead of real randomness.
pub trait RngSource {
    /// Return a value uniformly distributed in `[0.0, 1.0)`.
    fn uniform_unit(&mut self) -> f64;
}

/// OS randomness, used in production.
pub struct OsRng;

impl RngSource for OsRng {
    fn uniform_unit(&mut self) -> f64 {
        rand::rngs::OsRng.gen::<f64>()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("invalid cron expression {0:?}: {1}")]
    InvalidCron(String, String),
    #[error("invalid interval spec {0:?}")]
    InvalidInterval(String),
    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),
}

fn resolve_tz(timezone: &Option<String>) -> Result<Tz, TriggerError> {
    match timezone {
        None => Ok(chrono_tz::UTC),
        Some(name) => Tz::from_str(name).map_err(|_| TriggerError::UnknownTimezone(name.clone())),
    }
}

/// Compute the next wall time at which `trigger` should fire, strictly after
/// `now`. `last_fire`, when known, seeds interval and random-window logic.
pub fn next_fire(
    trigger: &Trigger,
    now: DateTime<Utc>,
    last_fire: Option<DateTime<Utc>>,
    rng: &mut dyn RngSource,
) -> Result<Option<DateTime<Utc>>, TriggerError> {
    match trigger {
        Trigger::Cron { expression, timezone } => next_cron_fire(expression, now, timezone),
        Trigger::Interval { spec } => Ok(Some(next_interval_fire(spec, now, last_fire)?)),
        Trigger::RandomWindow { window, timezone } => {
            Ok(next_random_window_fire(window, now, last_fire, timezone, rng)?)
        }
        Trigger::Weekly { weekday, time, timezone } => {
            Ok(Some(next_weekly_fire(*weekday, *time, now, timezone)?))
        }
        Trigger::Monthly { day_of_month, time, timezone } => {
            Ok(Some(next_monthly_fire(*day_of_month, *time, now, timezone)?))
        }
        Trigger::SpecificDate { at } => Ok((*at > now).then_some(*at)),
    }
}

/// Whether `trigger` carries its own window (only [`Trigger::RandomWindow`]
/// does; other window-bearing triggers take their window from the job's
/// separately declared `success_repeat` window, see `catalog::Job`).
pub fn own_window(trigger: &Trigger) -> Option<TimeWindow> {
    match trigger {
        Trigger::RandomWindow { window, .. } => Some(*window),
        _ => None,
    }
}

/// Whether this trigger kind may carry a success-repeat window at all.
pub fn is_window_bearing(trigger: &Trigger) -> bool {
    matches!(
        trigger,
        Trigger::Cron { .. }
            | Trigger::RandomWindow { .. }
            | Trigger::Weekly { .. }
            | Trigger::Monthly { .. }
            | Trigger::SpecificDate { .. }
    )
}

fn next_cron_fire(
    expression: &str,
    now: DateTime<Utc>,
    timezone: &Option<String>,
) -> Result<Option<DateTime<Utc>>, TriggerError> {
    // The `cron` crate requires a leading seconds field; our cron expressions
    // are minute/hour/dom/month/dow, so we pin seconds to 0.
    let six_field = format!("0 {expression}");
    let schedule = cron::Schedule::from_str(&six_field)
        .map_err(|e| TriggerError::InvalidCron(expression.to_string(), e.to_string()))?;
    let tz = resolve_tz(timezone)?;
    let now_local = now.with_timezone(&tz);
    let next = schedule.after(&now_local).next().map(|dt| dt.with_timezone(&Utc));
    Ok(next)
}

fn parse_interval_seconds(spec: &str) -> Result<f64, TriggerError> {
    let spec = spec.trim();
    let (number, suffix) = spec.split_at(
        spec.find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(spec.len()),
    );
    let value: f64 = number
        .parse()
        .map_err(|_| TriggerError::InvalidInterval(spec.to_string()))?;
    let multiplier = match suffix {
        "" | "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        _ => return Err(TriggerError::InvalidInterval(spec.to_string())),
    };
    Ok(value * multiplier)
}

fn next_interval_fire(
    spec: &str,
    now: DateTime<Utc>,
    last_fire: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>, TriggerError> {
    let seconds = parse_interval_seconds(spec)?;
    let interval = ChronoDuration::milliseconds((seconds * 1000.0).round() as i64);
    Ok(match last_fire {
        Some(last) => last + interval,
        None => now + interval,
    })
}

fn next_random_window_fire(
    window: &TimeWindow,
    now: DateTime<Utc>,
    last_fire: Option<DateTime<Utc>>,
    timezone: &Option<String>,
    rng: &mut dyn RngSource,
) -> Result<Option<DateTime<Utc>>, TriggerError> {
    let tz = resolve_tz(timezone)?;
    let now_local = now.with_timezone(&tz);
    let today = now_local.date_naive();
    let mut window_start = tz
        .from_local_datetime(&today.and_time(window.start))
        .single()
        .unwrap_or(now_local);
    let mut window_end = tz
        .from_local_datetime(&today.and_time(window.end))
        .single()
        .unwrap_or(now_local);

    if now_local > window_end {
        // Today's window is over; roll to tomorrow.
        let tomorrow = today + ChronoDuration::days(1);
        window_start = tz
            .from_local_datetime(&tomorrow.and_time(window.start))
            .single()
            .unwrap_or(window_start);
        window_end = tz
            .from_local_datetime(&tomorrow.and_time(window.end))
            .single()
            .unwrap_or(window_end);
    }

    if let Some(last) = last_fire {
        let last_local = last.with_timezone(&tz);
        if last_local >= window_start && last_local <= window_end {
            // Already fired within this window; no further random fires.
            return Ok(None);
        }
    }

    let pick_start = window_start.max(now_local);
    if pick_start > window_end {
        return Ok(None);
    }
    let span = (window_end - pick_start).num_milliseconds().max(0) as f64;
    let offset_ms = (rng.uniform_unit() * span).round() as i64;
    let picked = pick_start + ChronoDuration::milliseconds(offset_ms);
    Ok(Some(picked.with_timezone(&Utc)))
}

fn next_weekly_fire(
    weekday: Weekday,
    time: NaiveTime,
    now: DateTime<Utc>,
    timezone: &Option<String>,
) -> Result<DateTime<Utc>, TriggerError> {
    let tz = resolve_tz(timezone)?;
    let now_local = now.with_timezone(&tz);
    let today = now_local.date_naive();
    for days_ahead in 0..=7 {
        let candidate_date = today + ChronoDuration::days(days_ahead);
        if candidate_date.weekday() != weekday {
            continue;
        }
        if let Some(candidate) = local_instant_at_or_after_dst_gap(&tz, candidate_date, time) {
            if candidate > now_local {
                return Ok(candidate.with_timezone(&Utc));
            }
        }
    }
    // Should be unreachable: within 7 days there is always exactly one match
    // unless today matches but time already passed, handled by the loop's
    // upper bound of 7 (covers the following occurrence of the same weekday).
    let candidate_date = today + ChronoDuration::days(7);
    let candidate = local_instant_at_or_after_dst_gap(&tz, candidate_date, time)
        .unwrap_or(now_local + ChronoDuration::days(7));
    Ok(candidate.with_timezone(&Utc))
}

fn next_monthly_fire(
    day_of_month: u32,
    time: NaiveTime,
    now: DateTime<Utc>,
    timezone: &Option<String>,
) -> Result<DateTime<Utc>, TriggerError> {
    let tz = resolve_tz(timezone)?;
    let now_local = now.with_timezone(&tz);
    let mut year = now_local.year();
    let mut month = now_local.month();
    for _ in 0..24 {
        if let Some(date) = chrono::NaiveDate::from_ymd_opt(year, month, day_of_month) {
            if let Some(candidate) = local_instant_at_or_after_dst_gap(&tz, date, time) {
                if candidate > now_local {
                    return Ok(candidate.with_timezone(&Utc));
                }
            }
        }
        month += 1;
        if month > 12 {
            month = 1;
            year += 1;
        }
    }
    // 24 months with no valid day_of_month (e.g. 31 in a run of short
    // months) is implausible but not impossible to reason about; surface as
    // "far future" rather than panicking.
    Ok((now_local + ChronoDuration::days(366)).with_timezone(&Utc))
}

/// Resolve a local date+time to an absolute instant, picking the earliest
/// valid instant at or after the nominal time on a DST-gap day, and the
/// earlier occurrence on a DST-fold (ambiguous) day.
fn local_instant_at_or_after_dst_gap(
    tz: &Tz,
    date: chrono::NaiveDate,
    time: NaiveTime,
) -> Option<DateTime<Tz>> {
    use chrono::offset::LocalResult;
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(earlier, _later) => Some(earlier),
        LocalResult::None => {
            // Gap: walk forward in small steps to the earliest valid instant.
            let mut probe = naive;
            for _ in 0..3600 {
                probe += ChronoDuration::minutes(1);
                if let LocalResult::Single(dt) = tz.from_local_datetime(&probe) {
                    return Some(dt);
                }
            }
            None
        }
    }
}

use chrono::Datelike;
