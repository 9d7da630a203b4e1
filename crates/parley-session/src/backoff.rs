use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff used while polling for a conversation the
/// backend has announced but may not be able to serve yet.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Delay before attempt `attempt` (zero-based): `base * 2^attempt`,
    /// capped at `max_delay`, then spread by `±jitter_factor`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp_delay = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(31) as i32);
        let capped = exp_delay.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Worst-case total wait across all attempts.
    pub fn max_total(&self) -> Duration {
        (0..self.max_attempts)
            .map(|attempt| {
                let exp = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(31) as i32);
                let capped = exp.min(self.max_delay.as_millis() as f64);
                Duration::from_millis((capped * (1.0 + self.jitter_factor.clamp(0.0, 1.0))).round() as u64)
            })
            .sum()
    }
}
