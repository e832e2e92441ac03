//! Monotonic and wall-clock time for the worker threads.
//!
//! Engine-level APIs take explicit [`TimePoint`]s so tests control time; the
//! workers stamp real time through this clock at their loop heads.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use vesper_common::TimePoint;

#[derive(Debug, Clone)]
pub struct Clock {
    start: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Milliseconds since this clock was created. Immune to wall-clock steps.
    pub fn monotonic_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Wall-clock milliseconds since the UNIX epoch.
    pub fn system_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn time_point(&self) -> TimePoint {
        TimePoint::new(self.system_ms(), self.monotonic_ms())
    }
}
