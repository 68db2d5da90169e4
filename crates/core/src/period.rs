//! Fixed 15-second activity periods.
//!
//! A period is identified by its start instant, the timestamp truncated down
//! to the nearest multiple of [`PERIOD_SECS`] since the Unix epoch. Windows are
//! half-open: `[start, start + 15s)`.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};

pub const PERIOD_SECS: i64 = 15;

/// Length of one period.
pub fn period_length() -> TimeDelta {
    TimeDelta::seconds(PERIOD_SECS)
}

/// Truncate a timestamp down to the start of its period.
pub fn period_start(ts: NaiveDateTime) -> NaiveDateTime {
    let secs = ts.and_utc().timestamp();
    let start = secs - secs.rem_euclid(PERIOD_SECS);
    DateTime::from_timestamp(start, 0)
        .map(|dt| dt.naive_utc())
        .unwrap_or(ts)
}

/// Exclusive end of the period starting at `start`.
pub fn period_end(start: NaiveDateTime) -> NaiveDateTime {
    start + period_length()
}

/// Start of the period containing the current wall-clock time.
pub fn current_period() -> NaiveDateTime {
    period_start(Utc::now().naive_utc())
}

/// Time left until the next period boundary.
pub fn until_next_boundary(now: NaiveDateTime) -> Duration {
    let next = period_end(period_start(now));
    (next - now).to_std().unwrap_or_default()
}

/// Convert a block timestamp (seconds since epoch) into a naive UTC datetime.
pub fn from_unix(secs: u64) -> NaiveDateTime {
    DateTime::from_timestamp(secs as i64, 0)
        .unwrap_or_default()
        .naive_utc()
}
