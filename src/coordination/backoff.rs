use rand::Rng;
use std::time::Duration;

/// Linear reconnect backoff with positive jitter.
///
/// Formula: min(base * attempt, max_delay) + random_jitter
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    attempt: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.25,
            attempt: 0,
        }
    }
}

impl ReconnectBackoff {
    /// `jitter_factor` is clamped to 0..=1.
    pub fn new(base: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            max_delay,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    pub fn from_config(config: &crate::config::ConnectionConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_delay_ms),
            Duration::from_millis(config.reconnect_max_delay_ms),
            config.jitter_fraction,
        )
    }

    /// Calculate the next delay and increment the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let capped = self.base.saturating_mul(self.attempt).min(self.max_delay);

        let jitter_range = capped.as_secs_f64() * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(0.0..=jitter_range)
        } else {
            0.0
        };

        capped + Duration::from_secs_f64(jitter)
    }

    /// Reset the attempt counter (call after a successful connection).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Exponential delay before order retry `attempt` (1-based): base * 2^(attempt-1), capped.
pub fn order_retry_delay(base: Duration, attempt: u32, max_delay: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(2u32.saturating_pow(exponent)).min(max_delay)
}
