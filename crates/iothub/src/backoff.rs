//! Reconnect backoff for the connection kernel.
//!
//! After a transient connection failure the kernel waits before polling the
//! event loop again. The wait grows geometrically and saturates:
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max)
//! ```
//!
//! Unlike a retry budget there is no attempt limit: a device keeps trying for
//! as long as it is powered. `reset()` is called on every successful CONNACK.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
    max: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff schedule.
    ///
    /// A `multiplier` below 1.0 is clamped to 1.0 and a `max` below `initial`
    /// is raised to `initial`, so the schedule is never shrinking.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            current: initial,
            max: max.max(initial),
            multiplier: multiplier.max(1.0),
            attempt: 0,
        }
    }

    /// Returns the delay for the next attempt and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }
}

impl Default for Backoff {
    /// 1s initial, doubling, capped at 60s.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2.0)
    }
}
