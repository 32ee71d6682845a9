//! Queue watchdog
//!
//! Measures how long the queue has been continuously non-empty. A queue that
//! never drains means the RTU side is wedged; the watchdog reports it once so
//! the host can restart the process.

use std::time::{Duration, Instant};

/// Default threshold before a restart is requested
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone)]
pub struct Watchdog {
    threshold: Duration,
    busy_since: Option<Instant>,
    fired: bool,
}

impl Watchdog {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            busy_since: None,
            fired: false,
        }
    }

    /// Feed one observation of the queue
    ///
    /// Returns how long the queue has been stuck the first time that exceeds
    /// the threshold, `None` otherwise.
    pub fn observe(&mut self, queue_empty: bool, now: Instant) -> Option<Duration> {
        if queue_empty {
            self.busy_since = None;
            return None;
        }

        let since = *self.busy_since.get_or_insert(now);
        let stuck_for = now.saturating_duration_since(since);
        if stuck_for > self.threshold && !self.fired {
            self.fired = true;
            return Some(stuck_for);
        }
        None
    }

    pub fn is_running(&self) -> bool {
        self.busy_since.is_some()
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new(DEFAULT_WATCHDOG_TIMEOUT)
    }
}
