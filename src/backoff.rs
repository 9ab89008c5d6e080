//! Reconnect backoff
//!
//! Truncated exponential backoff without jitter: the delay doubles with
//! each consecutive failure and then holds at the cap. The attempt ceiling
//! lives here too so the whole retry policy is one testable value.
use crate::config::SessionConfig;

/// Exponential backoff delay
///
/// Formula: `min(base_ms * 2^attempt, max_delay_ms)`
pub fn calculate_backoff_ms(attempt: u32, base_ms: u64, max_delay_ms: u64) -> u64 {
    let factor = 2u64.saturating_pow(attempt);
    base_ms.saturating_mul(factor).min(max_delay_ms)
}

/// Retry policy for the connection session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_ms: u64, cap_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_ms,
            cap_ms,
            max_attempts,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            config.backoff_base_ms,
            config.backoff_cap_ms,
            config.max_reconnect_attempts,
        )
    }

    /// Delay before the next connect after `failures` consecutive failures
    ///
    /// Zero failures (a healthy link that was torn down) waits the base delay.
    pub fn delay_ms(&self, failures: u32) -> u64 {
        calculate_backoff_ms(failures.saturating_sub(1), self.base_ms, self.cap_ms)
    }

    /// Whether `failures` consecutive failures reach the ceiling
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        assert_eq!(calculate_backoff_ms(0, 100, 5000), 100);
        assert_eq!(calculate_backoff_ms(1, 100, 5000), 200);
        assert_eq!(calculate_backoff_ms(2, 100, 5000), 400);
        assert_eq!(calculate_backoff_ms(3, 100, 5000), 800);
        assert_eq!(calculate_backoff_ms(10, 100, 5000), 5000);
    }

    #[test]
    fn test_no_overflow_on_huge_attempt() {
        assert_eq!(calculate_backoff_ms(200, 500, 10_000), 10_000);
        assert_eq!(calculate_backoff_ms(u32::MAX, u64::MAX, 7), 7);
    }

    #[test]
    fn test_delay_monotone_and_capped() {
        let policy = ReconnectPolicy::new(500, 10_000, 50);
        let mut previous = 0;
        for failures in 0..50 {
            let delay = policy.delay_ms(failures);
            assert!(delay >= previous, "delay shrank at {}", failures);
            assert!(delay <= 10_000);
            previous = delay;
        }
        assert_eq!(previous, 10_000);
    }

    #[test]
    fn test_exhaustion_threshold() {
        let policy = ReconnectPolicy::new(100, 1000, 3);
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }
}
