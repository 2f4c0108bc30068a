//! Wall-clock source for cache ages and record timestamps.
//!
//! Timers (time-boxes, retry delays) run on tokio's clock; this trait only
//! answers "what time is it", so tests can pin it without touching timers.

use time::OffsetDateTime;

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Reads the system clock in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Epoch milliseconds, the unit the cached-session entry is stored in.
#[must_use]
pub fn epoch_millis(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}
