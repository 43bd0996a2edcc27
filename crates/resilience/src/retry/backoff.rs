//! Exponential backoff with multiplicative jitter

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::RetryConfig;

/// Delay sequence for one retry run.
///
/// Shared by the blocking and async executors, so a seeded schedule yields
/// identical delays in both.
#[derive(Debug)]
pub struct BackoffSchedule {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_fraction: f64,
    rng: StdRng,
}

impl BackoffSchedule {
    pub fn new(config: &RetryConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            multiplier: config.multiplier,
            jitter_fraction: config.jitter_fraction,
            rng,
        }
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based):
    /// `min(max_delay, base_delay * multiplier^(attempt - 1))`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }

    /// Jittered delay after failed attempt `attempt`.
    pub fn next_delay(&mut self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter_fraction == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + self.rng.gen_range(-self.jitter_fraction..=self.jitter_fraction);
        let secs = (delay.as_secs_f64() * factor).max(0.0);
        Duration::try_from_secs_f64(secs).unwrap_or(delay)
    }
}
