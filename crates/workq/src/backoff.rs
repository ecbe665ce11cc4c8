//! Randomized exponential backoff schedule for job retries.

use std::time::Duration;

use rand::Rng;

/// Randomized exponential backoff.
///
/// Each step multiplies the nominal interval and jitters it by the
/// randomization factor, saturating at `max_interval`. There is no cap on
/// total elapsed time; a job keeps retrying at roughly `max_interval` once
/// the schedule saturates. Parameters follow the gRPC connection-backoff
/// recommendations.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
    pub max_interval: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            multiplier: 1.6,
            randomization_factor: 0.2,
            max_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl ExponentialBackoff {
    /// The `step`-th delay (1-based) of a fresh schedule.
    pub fn delay(&self, step: u32) -> Duration {
        self.delay_with(step, &mut rand::thread_rng())
    }

    /// Same as [`delay`](Self::delay) with an explicit randomness source so
    /// callers can seed the jitter.
    pub fn delay_with<R: Rng>(&self, step: u32, rng: &mut R) -> Duration {
        let max = self.max_interval.as_secs_f64();
        let mut interval = self.initial_interval.as_secs_f64();
        let mut next = interval;
        for _ in 0..step {
            next = self.randomize(interval, rng);
            interval = (interval * self.multiplier).min(max);
        }
        Duration::from_secs_f64(next)
    }

    fn randomize<R: Rng>(&self, interval: f64, rng: &mut R) -> f64 {
        if self.randomization_factor <= 0.0 {
            return interval;
        }
        let delta = self.randomization_factor * interval;
        rng.gen_range(interval - delta..=interval + delta)
    }
}
