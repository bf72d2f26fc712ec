//! Next-run computation for recurring schedules.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Months, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::ScheduleError;

/// How often a schedule repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepeatInterval {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl RepeatInterval {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "Hourly",
            Self::Daily => "Daily",
            Self::Weekly => "Weekly",
            Self::Monthly => "Monthly",
        }
    }

    /// Fixed length of one step, or `None` for calendar months.
    fn fixed_step(self) -> Option<TimeDelta> {
        match self {
            Self::Hourly => Some(TimeDelta::hours(1)),
            Self::Daily => Some(TimeDelta::days(1)),
            Self::Weekly => Some(TimeDelta::weeks(1)),
            Self::Monthly => None,
        }
    }

    /// Advance `at` by one step. Months clamp to the last day of a shorter month.
    fn advance(self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.fixed_step() {
            Some(step) => at.checked_add_signed(step),
            None => at.checked_add_months(Months::new(1)),
        }
    }
}

impl fmt::Display for RepeatInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepeatInterval {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Hourly, Self::Daily, Self::Weekly, Self::Monthly]
            .into_iter()
            .find(|i| i.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ScheduleError::InvalidInterval(s.to_string()))
    }
}

/// First occurrence of the series `start_at, start_at + interval, ...` strictly after `now`.
///
/// A start in the future is returned unchanged. Otherwise the series is
/// walked forward one step at a time, so month steps compound their
/// clamping: Jan 31 goes to Feb 29 (leap year) and then Mar 29.
/// Fixed-length steps skip whole multiples first, which lands on the same
/// element of the series.
pub fn compute_next_run(
    start_at: DateTime<Utc>,
    interval: RepeatInterval,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    if start_at > now {
        return Ok(start_at);
    }

    let mut next = start_at;
    if let Some(step) = interval.fixed_step() {
        let steps = (now - start_at).num_seconds() / step.num_seconds();
        let skip = i32::try_from(steps).map_err(|_| ScheduleError::OutOfRange)?;
        next = next
            .checked_add_signed(step * skip)
            .ok_or(ScheduleError::OutOfRange)?;
    }

    while next <= now {
        next = interval.advance(next).ok_or(ScheduleError::OutOfRange)?;
    }
    Ok(next)
}
