//! Time source abstraction.
//!
//! Job timestamps (`available_at`, `lock_expires_at`) are wall-clock values
//! compared across processes, so they come from a [`Clock`] rather than from
//! `Utc::now()` directly. Tests drive a [`MockClock`] forward instead of
//! sleeping.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// `at + duration`, clamped to the latest representable time.
pub fn offset(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    let ms = duration.as_millis().min(i64::MAX as u128) as i64;
    chrono::Duration::try_milliseconds(ms)
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually advanced clock for tests and simulations.
#[derive(Debug, Clone)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self.current_time.lock();
        *time += duration;
    }

    pub fn advance_std(&self, duration: Duration) {
        let mut time = self.current_time.lock();
        *time = offset(*time, duration);
    }

    pub fn set(&self, time: DateTime<Utc>) {
        *self.current_time.lock() = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current_time.lock()
    }
}
