//! Exponential backoff between workflow step tries.

use std::time::Duration;

/// `base * 2^try_index`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay to wait after the try with zero-based index `try_index` failed.
    pub fn delay(&self, try_index: u32) -> Duration {
        2u32.checked_pow(try_index)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}
