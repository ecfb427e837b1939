//! Capped exponential backoff between retries.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(base);
        Backoff {
            base,
            ceiling,
            current: base,
            failures: 0,
        }
    }

    /// Delay to sleep after a failure. Each call doubles the next delay until
    /// it reaches the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        self.failures += 1;
        delay
    }

    /// Back to the base delay after a success.
    pub fn reset(&mut self) {
        self.current = self.base;
        self.failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// Delay the next failure would produce.
    pub fn peek(&self) -> Duration {
        self.current
    }
}
