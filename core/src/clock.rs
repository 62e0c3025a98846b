//! Wall clock used for ingestion and audit timestamps.
//!
//! RULE: Nothing in the core calls `Utc::now()` directly.
//! Timestamps flow through a `Clock` so tests can pin them.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock. Every call returns the current instant and then
/// advances by `step`, so consecutive audit entries get increasing stamps.
#[derive(Debug)]
pub struct FixedClock {
    current: Mutex<DateTime<Utc>>,
    step:    Duration,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self::with_step(start, Duration::seconds(1))
    }

    pub fn with_step(start: DateTime<Utc>, step: Duration) -> Self {
        Self {
            current: Mutex::new(start),
            step,
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        let mut guard = self.current.lock().unwrap_or_else(|p| p.into_inner());
        let now = *guard;
        *guard = now + self.step;
        now
    }
}
