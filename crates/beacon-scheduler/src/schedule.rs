use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{Result, SchedulerError};
use crate::types::Schedule;

/// Longest interval a recurring job may use, in days (100 years).
pub const MAX_INTERVAL_DAYS: i64 = 365 * 100;

/// Compute the `run_at` of the first instance for a newly registered job.
pub fn first_run(schedule: &Schedule, now: DateTime<Utc>) -> DateTime<Utc> {
    match schedule {
        Schedule::OneOff { first_run } => first_run.unwrap_or(now),
        Schedule::Recurring {
            interval,
            first_run,
        } => first_run.unwrap_or(now + *interval),
    }
}

/// Compute the `run_at` of the instance following one scheduled at `prev`.
///
/// Normally `prev + interval`. When that instant already lies more than one
/// interval in the past the scheduler has fallen behind, and the schedule is
/// re-anchored at `now + interval` instead of emitting a burst of
/// immediately-due instances.
pub fn next_run(prev: DateTime<Utc>, interval: TimeDelta, now: DateTime<Utc>) -> DateTime<Utc> {
    let next = prev + interval;
    if now - next > interval {
        now + interval
    } else {
        next
    }
}

/// Exponential retry delay: `base * 2^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    pub fn delay_delta(&self, attempt: u32) -> TimeDelta {
        to_delta(self.delay(attempt))
    }
}

/// Convert a std duration, saturating at the longest representable delta.
pub fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// Parse a recurring interval as sent by API clients.
///
/// A bare integer is a number of seconds; `ms`, `s`, `m` and `h` suffixes are
/// accepted (`500ms`, `2s`, `15m`, `1h`).
pub fn parse_interval(raw: &str) -> Result<TimeDelta> {
    let raw = raw.trim();
    let invalid = || SchedulerError::InvalidSchedule(format!("invalid interval: {raw:?}"));

    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    if digits.is_empty() {
        return Err(invalid());
    }
    let n: i64 = digits.parse().map_err(|_| invalid())?;

    let interval = match unit {
        "" | "s" => TimeDelta::try_seconds(n),
        "ms" => TimeDelta::try_milliseconds(n),
        "m" => TimeDelta::try_minutes(n),
        "h" => TimeDelta::try_hours(n),
        _ => None,
    }
    .ok_or_else(invalid)?;

    validate_interval(interval)?;
    Ok(interval)
}

/// Reject intervals a recurring job cannot run on.
pub fn validate_interval(interval: TimeDelta) -> Result<()> {
    if interval <= TimeDelta::zero() {
        return Err(SchedulerError::InvalidSchedule(
            "interval must be positive".to_string(),
        ));
    }
    if interval > TimeDelta::days(MAX_INTERVAL_DAYS) {
        return Err(SchedulerError::InvalidSchedule(
            "interval is longer than 100 years".to_string(),
        ));
    }
    Ok(())
}
