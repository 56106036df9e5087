//! # Fibonacci Backoff
//!
//! Progressive backoff for failed reconciliations. It grows more slowly than
//! exponential backoff, so a machine stuck on a flaky host is retried often enough to
//! recover quickly without hammering the microvm service.
//!
//! Sequence with the controller defaults: 30s, 30s, 60s, 90s, 150s, 240s, 390s, 600s (max).

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at the maximum.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum backoff in seconds (first two values)
    min_secs: u64,
    /// Previous backoff in seconds
    prev_secs: u64,
    /// Current backoff in seconds
    current_secs: u64,
    /// Maximum backoff in seconds
    max_secs: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff between `min` and `max`
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let min_secs = min.as_secs().max(1);
        Self {
            min_secs,
            prev_secs: 0,
            current_secs: min_secs,
            max_secs: max.as_secs().max(min_secs),
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_secs;

        let next = self.prev_secs + self.current_secs;
        self.prev_secs = self.current_secs;
        self.current_secs = std::cmp::min(next, self.max_secs);

        Duration::from_secs(result)
    }
}
