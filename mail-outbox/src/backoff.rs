//! Retry delay policy.
//!
//! `delay(attempts) = min(base * 2^attempts, cap) + jitter`, with jitter drawn
//! uniformly from `[0, jitter_ratio * capped)`. `attempts` is the failure
//! count including the failure being recorded, so the first retry waits
//! about `2 * base`.

use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;

pub trait Backoff: Send + Sync {
    fn delay(&self, attempts: u32) -> Duration;
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExponentialBackoff {
    base_ms: u64,
    cap_ms: u64,
    jitter_ratio: f64,
}

impl ExponentialBackoff {
    // 2^20 * base already passes any sane cap
    const MAX_EXPONENT: u32 = 20;

    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base_ms: config.base_ms,
            cap_ms: config.cap_ms,
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// Exponential delay before jitter, in milliseconds.
    pub fn capped_ms(&self, attempts: u32) -> u64 {
        let exponent = attempts.min(Self::MAX_EXPONENT);
        self.base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.cap_ms)
    }

    /// The delay for a fixed jitter `fraction` in `[0, 1)`.
    pub fn delay_with_jitter(&self, attempts: u32, fraction: f64) -> Duration {
        let capped = self.capped_ms(attempts);
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let max_jitter = self.jitter_ratio * capped as f64;
        // Floor keeps the jitter strictly below `max_jitter` for fraction < 1.
        let jitter = (fraction * max_jitter).floor() as u64;
        Duration::from_millis(capped.saturating_add(jitter))
    }

    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn cap(&self) -> Duration {
        Duration::from_millis(self.cap_ms)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(&BackoffConfig::default())
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempts: u32) -> Duration {
        let fraction: f64 = rand::thread_rng().gen_range(0.0..1.0);
        self.delay_with_jitter(attempts, fraction)
    }
}

/// Same delay every time. Handy for tests and for transports with their own pacing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedBackoff(pub Duration);

impl Backoff for FixedBackoff {
    fn delay(&self, _attempts: u32) -> Duration {
        self.0
    }
}
