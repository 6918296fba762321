//! Time-of-day dependent inactive grace periods.
//!
//! Nodes must be idle for the applicable grace period before they become
//! eligible for termination. The applicable value can vary by time of day
//! and day of week, e.g. to drain more aggressively overnight.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde_json::json;

use crate::errors::ConfigError;

/// Grace period applied when no configured window matches.
pub const DEFAULT_GRACE_SECONDS: i64 = 600;

const SECONDS_PER_DAY: i64 = 86_400;

/// A node termination grace period window.
///
/// The window is the partially closed range `[starts, ends)` expressed in
/// seconds since midnight. Overnight windows, where the end is an earlier
/// time than the start, are supported. An empty `days_of_week` matches
/// every day; otherwise days are ISO numbered (1=Monday .. 7=Sunday).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InactiveGracePeriod {
    pub day_seconds_starts: i64,
    pub day_seconds_ends: i64,
    pub value: i64,
    pub days_of_week: Vec<u32>,
}

impl Default for InactiveGracePeriod {
    fn default() -> Self {
        Self {
            day_seconds_starts: 0,
            day_seconds_ends: SECONDS_PER_DAY,
            value: DEFAULT_GRACE_SECONDS,
            days_of_week: Vec::new(),
        }
    }
}

impl InactiveGracePeriod {
    /// Determine if the specified time is in the range of this period.
    pub fn in_range_of(&self, date_time: DateTime<Utc>) -> bool {
        let iso_day_of_week = date_time.weekday().number_from_monday();
        if !self.days_of_week.is_empty() && !self.days_of_week.contains(&iso_day_of_week) {
            return false;
        }

        let value = date_time.num_seconds_from_midnight() as i64;
        let s = self.day_seconds_starts;
        let e = self.day_seconds_ends;
        (s < e && s <= value && value < e)
            // Overnight where the end is less than the start and the value
            // is later in the evening (after start) but before midnight.
            || (e < s && s <= value)
            // Overnight where the end is less than the start and the value
            // is earlier in the morning (before end) but after midnight.
            || (s > e && e > value)
    }

    pub fn to_log_data(&self, now: DateTime<Utc>) -> serde_json::Value {
        json!({
            "day_seconds_starts": self.day_seconds_starts,
            "day_seconds_ends": self.day_seconds_ends,
            "value": self.value,
            "in_range_of_now": self.in_range_of(now),
            "days_of_week": if self.days_of_week.is_empty() {
                serde_json::Value::Null
            } else {
                json!(self.days_of_week)
            },
        })
    }
}

/// Convert a `(H)H`, `(H)H:MM` or `(H)H:MM:SS` string into seconds since
/// midnight.
pub fn to_day_seconds(value: &str) -> Result<i64, ConfigError> {
    let trimmed = value.trim();
    let mut parts = trimmed.split(':');
    let mut fields = [0_i64; 3];
    for (index, multiplier) in [3600, 60, 1].iter().enumerate() {
        let Some(part) = parts.next() else { break };
        let number: i64 = part
            .parse()
            .map_err(|_| ConfigError::InvalidTimeValue(value.to_string()))?;
        fields[index] = number * multiplier;
    }
    if parts.next().is_some() || trimmed.is_empty() {
        return Err(ConfigError::InvalidTimeValue(value.to_string()));
    }
    Ok(fields.iter().sum())
}

/// Parse config data into a prioritized list of grace periods.
///
/// The default full-day grace period is always appended so a lookup never
/// falls through without a value.
pub fn grace_periods_from_config(
    periods: Vec<InactiveGracePeriod>,
) -> Vec<InactiveGracePeriod> {
    let mut output = periods;
    output.push(InactiveGracePeriod::default());
    output
}

/// Find the applicable grace period value for the given time.
///
/// The first matching entry wins; entries are held in configuration order.
pub fn inactive_grace_period(
    periods: &[InactiveGracePeriod],
    date_time: DateTime<Utc>,
) -> i64 {
    periods
        .iter()
        .find(|p| p.in_range_of(date_time))
        .map(|p| p.value)
        .unwrap_or(DEFAULT_GRACE_SECONDS)
}
