use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ember_core::PlaceholderResolver;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// Defines when a job is admitted to the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Admit right away.
    Immediate,

    /// Admit once, `after` from now.
    Delay { after: Duration },

    /// Admit once at an absolute UTC instant. Instants in the past are rejected.
    At { at: DateTime<Utc> },

    /// Admit at `start + n * period`, where `start` is `initial_delay` from
    /// scheduling. Ticks missed because a run overran are skipped; runs of
    /// the same job never overlap.
    FixedRate {
        period: Duration,
        initial_delay: Duration,
    },

    /// Admit `period` after the previous run finished.
    FixedDelay {
        period: Duration,
        initial_delay: Duration,
    },
}

impl Trigger {
    pub fn delay(after: Duration) -> Self {
        Trigger::Delay { after }
    }

    pub fn at(at: DateTime<Utc>) -> Self {
        Trigger::At { at }
    }

    /// Fixed-rate trigger whose first admission is one period away.
    pub fn every(period: Duration) -> Self {
        Trigger::FixedRate {
            period,
            initial_delay: period,
        }
    }

    /// Fixed-delay trigger whose first admission is one period away.
    pub fn fixed_delay(period: Duration) -> Self {
        Trigger::FixedDelay {
            period,
            initial_delay: period,
        }
    }

    /// Override the first admission delay of a periodic trigger.
    /// One-shot triggers are returned unchanged.
    pub fn with_initial_delay(self, delay: Duration) -> Self {
        match self {
            Trigger::FixedRate { period, .. } => Trigger::FixedRate {
                period,
                initial_delay: delay,
            },
            Trigger::FixedDelay { period, .. } => Trigger::FixedDelay {
                period,
                initial_delay: delay,
            },
            other => other,
        }
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self, Trigger::FixedRate { .. } | Trigger::FixedDelay { .. })
    }

    pub fn period(&self) -> Option<Duration> {
        match self {
            Trigger::FixedRate { period, .. } | Trigger::FixedDelay { period, .. } => Some(*period),
            _ => None,
        }
    }

    /// How long from `now` until the first admission.
    ///
    /// Fails for instants before `now`, for zero periods and for delays or
    /// periods too large to put on the timer.
    pub fn first_admission(&self, now: DateTime<Utc>) -> Result<Duration> {
        match self {
            Trigger::Immediate => Ok(Duration::ZERO),
            Trigger::Delay { after } => within_timer_range(*after, Duration::ZERO),
            Trigger::At { at } => (*at - now).to_std().map_err(|_| {
                SchedulerError::InvalidSchedule(format!(
                    "instant {} is in the past",
                    at.to_rfc3339()
                ))
            }),
            Trigger::FixedRate {
                period,
                initial_delay,
            }
            | Trigger::FixedDelay {
                period,
                initial_delay,
            } => {
                if period.is_zero() {
                    return Err(SchedulerError::InvalidSchedule(
                        "period must be greater than zero".into(),
                    ));
                }
                within_timer_range(*initial_delay, *period)
            }
        }
    }
}

/// Accept `delay` only if `now + delay + period` is a representable instant.
fn within_timer_range(delay: Duration, period: Duration) -> Result<Duration> {
    Instant::now()
        .checked_add(delay)
        .and_then(|first| first.checked_add(period))
        .map(|_| delay)
        .ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!("duration out of range: {delay:?} / {period:?}"))
        })
}

/// Replace a whole-string `${key}` placeholder with its configured value.
///
/// Strings without a placeholder are returned as-is.
pub fn resolve_placeholder(raw: &str, resolver: Option<&dyn PlaceholderResolver>) -> Result<String> {
    let trimmed = raw.trim();
    let Some(key) = trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return Ok(trimmed.to_string());
    };

    let key = key.trim();
    resolver
        .and_then(|r| r.resolve(key))
        .ok_or_else(|| SchedulerError::InvalidSchedule(format!("unresolved placeholder: {key}")))
}

/// Parse a duration string such as `10s`, `5m`, `1h30m`, `2d` or `500ms`.
///
/// A bare integer is a number of seconds. Accepted units: `ms`; `s`/`sec`/`secs`;
/// `m`/`mi`/`mn`/`min`/`mins`; `h`/`hr`/`hrs`; `d`/`day`/`days`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let input = raw.trim().to_ascii_lowercase();
    let invalid = |why: &str| SchedulerError::InvalidSchedule(format!("bad duration {raw:?}: {why}"));

    if input.is_empty() {
        return Err(invalid("empty"));
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total_ms: u64 = 0;
    let mut rest = input.as_str();
    while !rest.is_empty() {
        rest = rest.trim_start();
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            return Err(invalid("expected a number"));
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid("number too large"))?;
        rest = rest[digits..].trim_start();

        let unit_len = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()).len();
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let unit_ms: u64 = match unit {
            "ms" => 1,
            "s" | "sec" | "secs" | "second" | "seconds" => 1_000,
            "m" | "mi" | "mn" | "min" | "mins" | "minute" | "minutes" => 60_000,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3_600_000,
            "d" | "day" | "days" => 86_400_000,
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit")),
        };

        total_ms = value
            .checked_mul(unit_ms)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| invalid("overflow"))?;
    }

    Ok(Duration::from_millis(total_ms))
}

/// Resolve an optional placeholder, then parse the result as a duration.
pub fn parse_duration_with(raw: &str, resolver: Option<&dyn PlaceholderResolver>) -> Result<Duration> {
    parse_duration(&resolve_placeholder(raw, resolver)?)
}
