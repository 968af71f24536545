//! Time source for the store
//!
//! The store never calls `Utc::now()` directly so that expiry, stamping and
//! conflict resolution can be driven deterministically in tests.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, DurationRound, Utc};

/// A source of wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
///
/// Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Arc::new(Mutex::new(now)))
    }

    /// Start at a whole number of seconds since the epoch
    pub fn at_secs(secs: i64) -> Self {
        Self::new(DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.lock() = now;
    }

    pub fn advance(&self, delta: Duration) {
        *self.lock() += delta;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

/// Truncate to the microsecond precision used in storage
pub fn truncate_micros(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::microseconds(1)).unwrap_or(t)
}

/// Issues strictly increasing write stamps
///
/// Two writes in the same clock tick (or after the wall clock stepped
/// backwards) still get distinct, ordered stamps.
#[derive(Debug, Default)]
pub(crate) struct Stamper {
    last: Option<DateTime<Utc>>,
}

impl Stamper {
    pub(crate) fn resume_after(last: Option<DateTime<Utc>>) -> Self {
        Self { last }
    }

    /// Next stamp, never earlier than `floor`
    pub(crate) fn next(&mut self, now: DateTime<Utc>, floor: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let mut stamp = truncate_micros(now);
        if let Some(last) = self.last {
            if stamp <= last {
                stamp = last + Duration::microseconds(1);
            }
        }
        if let Some(floor) = floor {
            if stamp <= floor {
                stamp = floor + Duration::microseconds(1);
            }
        }
        self.last = Some(stamp);
        stamp
    }
}
