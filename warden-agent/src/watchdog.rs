//! Data-flow watchdog
//!
//! Tracks the last message seen on the watched data topics. A silence longer
//! than the threshold fires once; the next message re-arms it.

use std::time::Duration;

#[derive(Debug)]
pub struct DataWatchdog {
    threshold_ms: i64,
    last_data: i64,
    fired: bool,
}

/// A silence that just crossed the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Silence {
    pub last_data: i64,
    pub silent_for_ms: i64,
}

impl DataWatchdog {
    /// Silence is measured from `started_at` until the first message.
    pub fn new(threshold: Duration, started_at: i64) -> Self {
        Self {
            threshold_ms: i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX),
            last_data: started_at,
            fired: false,
        }
    }

    pub fn record_data(&mut self, at: i64) {
        self.last_data = at;
        self.fired = false;
    }

    pub fn check_at(&mut self, now: i64) -> Option<Silence> {
        let silent_for_ms = now - self.last_data;
        if self.fired || silent_for_ms <= self.threshold_ms {
            return None;
        }
        self.fired = true;
        Some(Silence { last_data: self.last_data, silent_for_ms })
    }
}
