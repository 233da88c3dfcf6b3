//! Exponential reconnect delays with jitter.

use rand::Rng;
use std::time::Duration;

/// Delay for attempt `n` is drawn from `[d/2, d]` where
/// `d = min(base * 2^n, max)`.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The un-jittered delay of the current attempt.
    pub fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);

        let ceiling_ms = ceiling.as_millis() as u64;
        let half = ceiling_ms / 2;
        let jitter = rand::thread_rng().gen_range(0..=ceiling_ms - half);
        Duration::from_millis(half + jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
