//! Reconnect delays: exponential growth with jitter, capped.

use std::time::Duration;

use rand::Rng;

const GROWTH: f64 = 1.5;
const JITTER: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: i32,
}

impl Backoff {
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt. Each call grows the following one.
    pub fn delay(&mut self) -> Duration {
        let base = (self.min.as_secs_f64() * GROWTH.powi(self.attempt)).min(self.max.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::rng().random_range(1.0 - JITTER..=1.0 + JITTER);
        Duration::from_secs_f64(base * jitter).min(self.max)
    }

    /// Start over from the minimum delay after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
