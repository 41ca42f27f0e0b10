//! Time and timestamp helpers.
//!
//! Measurement replay processes historical buckets under the bucket's own
//! timestamp, so "now" is an explicit [`Clock`] value passed into any
//! computation that needs it — never ambient global state.

use chrono::{DateTime, Duration, Utc};

/// UTC timestamp used for measurements, queue entries, and health counters.
pub type Timestamp = DateTime<Utc>;

/// Return the current UTC time.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now()
}

/// Convert an epoch-milliseconds wire value into a [`Timestamp`].
#[must_use]
pub fn from_millis(millis: i64) -> Option<Timestamp> {
    DateTime::from_timestamp_millis(millis)
}

/// An explicit "current time" value.
///
/// A `Clock` is cheap to copy; replaying a historical measurement bucket
/// constructs a new `Clock` at the bucket's timestamp instead of mutating
/// any shared state, so the caller's clock is untouched afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clock {
    now: Timestamp,
}

impl Clock {
    /// A clock frozen at the wall-clock time of the call.
    #[must_use]
    pub fn system() -> Self {
        Self { now: now() }
    }

    /// A clock frozen at an arbitrary instant.
    #[must_use]
    pub fn at(now: Timestamp) -> Self {
        Self { now }
    }

    /// The instant this clock reads.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// The instant `ago` before this clock's reading.
    #[must_use]
    pub fn earlier(&self, ago: Duration) -> Timestamp {
        self.now - ago
    }
}
