// Exponential backoff with jitter

use rand::Rng;
use std::time::Duration;

use super::config::SchedulerConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.base_delay, config.max_delay, config.jitter)
    }

    /// Delay before retry `retry` (1-based) without jitter: `base * 2^(retry-1)`, capped
    pub fn nominal(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Jittered delay for a given random `unit` in [-1, 1]
    pub fn delay_with(&self, retry: u32, unit: f64) -> Duration {
        let nominal = self.nominal(retry).as_secs_f64();
        let scaled = nominal * (1.0 + self.jitter * unit.clamp(-1.0, 1.0));
        Duration::from_secs_f64(scaled.clamp(0.0, self.max.as_secs_f64()))
    }

    pub fn delay(&self, retry: u32) -> Duration {
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with(retry, unit)
    }
}
