//! Exponential backoff for bind retries.

use std::time::Duration;

/// Delay before bind attempt `attempt` (1-based retry count).
///
/// `base_ms * 2^(attempt - 1)`, capped at `max_ms`. Attempt 0 is the
/// initial bind and never waits.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    Duration::from_millis(delay_ms.min(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(0, 100, 5000), Duration::ZERO);
        assert_eq!(calculate_backoff(1, 100, 5000), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, 100, 5000), Duration::from_millis(200));
        assert_eq!(calculate_backoff(4, 100, 5000), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_capped() {
        assert_eq!(calculate_backoff(10, 100, 1000), Duration::from_millis(1000));
        assert_eq!(calculate_backoff(u32::MAX, u64::MAX, 5000), Duration::from_millis(5000));
    }
}
