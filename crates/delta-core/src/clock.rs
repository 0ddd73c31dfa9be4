//! Clock abstraction for record timestamps.
//!
//! Derived physical ids embed the write timestamp, so two local writes to the
//! same logical id within one millisecond would collide. `SystemClock` never
//! hands out the same instant twice.

use crate::record::Timestamp;
use std::sync::Mutex;
use web_time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Current time for a new record.
    fn now(&self) -> Timestamp;
}

/// Wall clock with millisecond resolution, strictly increasing per instance.
#[derive(Default)]
pub struct SystemClock {
    last: Mutex<Option<Timestamp>>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn wall_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let wall = Timestamp::from_millis(Self::wall_millis()).ok();
        let next = match (*last, wall) {
            (Some(prev), Some(wall)) if wall > prev => wall,
            (Some(prev), _) => prev.plus_millis(1),
            (None, Some(wall)) => wall,
            (None, None) => Timestamp::EPOCH,
        };
        *last = Some(next);
        next
    }
}

/// Hand-driven clock for tests. Every call to `now` advances by `step_millis`.
pub struct ManualClock {
    current: Mutex<Timestamp>,
    step_millis: i64,
}

impl ManualClock {
    pub fn starting_at(start: Timestamp) -> Self {
        Self {
            current: Mutex::new(start),
            step_millis: 1,
        }
    }

    /// Set how far each `now` call moves the clock (0 freezes it).
    pub fn with_step(mut self, step_millis: i64) -> Self {
        self.step_millis = step_millis;
        self
    }

    /// Jump the clock forward (or backward, to simulate skew).
    pub fn advance(&self, millis: i64) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = current.plus_millis(millis);
    }

    pub fn set(&self, at: Timestamp) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        let now = *current;
        *current = now.plus_millis(self.step_millis);
        now
    }
}
