use std::time::Duration;

/// Linear reconnect backoff with a hard attempt ceiling.
///
/// Attempt `n` (zero-based) waits `base * (n + 1)`, clamped to `max_delay_ms`.
/// Once `attempt >= max_attempts` the policy yields no delay and the caller
/// must stop retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            max_attempts,
        }
    }

    /// Delay before retry `attempt`, or `None` once the ceiling is reached.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let calculated = self
            .base_delay_ms
            .saturating_mul(u64::from(attempt).saturating_add(1));
        Some(Duration::from_millis(calculated.min(self.max_delay_ms)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1_000, 30_000, 5)
    }
}
