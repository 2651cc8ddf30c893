//! Time helpers. Every timestamp stored or compared by this crate is epoch
//! milliseconds in UTC.

use chrono::{DateTime, TimeZone, Utc};
use mockable::Clock;

/// Current time in epoch milliseconds.
pub fn now_millis(clock: &dyn Clock) -> i64 {
  clock.utc().timestamp_millis()
}

/// Convert epoch milliseconds back into a UTC datetime.
pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
  Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
pub(crate) use manual::ManualClock;
