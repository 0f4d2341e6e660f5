//! Exponential backoff for agent dispatch retries.

use rand::Rng;
use std::time::Duration;

use crate::registry::RetryPolicy;

/// Delay before retry number `attempt + 1`.
///
/// `base_delay * backoff_factor^attempt` plus up to 25% random jitter, capped
/// at `max_delay`. A server-provided `retry_after` wins when present but is
/// still capped.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, retry_after: Option<Duration>) -> Duration {
    let cap = policy.max_delay();
    if let Some(retry_after) = retry_after {
        return retry_after.min(cap);
    }

    let factor = if policy.backoff_factor.is_finite() && policy.backoff_factor >= 1.0 {
        policy.backoff_factor
    } else {
        1.0
    };
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let raw_ms = (policy.base_delay_ms as f64) * factor.powi(exponent);
    let capped_ms = raw_ms.min(cap.as_millis() as f64);

    let jitter_range = capped_ms / 4.0;
    let jitter_ms = if jitter_range >= 1.0 {
        rand::thread_rng().gen_range(0.0..jitter_range)
    } else {
        0.0
    };

    Duration::from_millis((capped_ms + jitter_ms) as u64).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_delay_ms: u64, backoff_factor: f64, max_delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff_factor,
            base_delay_ms,
            max_delay_ms,
        }
    }

    #[test]
    fn test_grows_exponentially_within_jitter() {
        let p = policy(100, 2.0, 60_000);
        for attempt in 0..5 {
            let expected = 100 * 2u64.pow(attempt);
            let delay = backoff_delay(&p, attempt, None).as_millis() as u64;
            assert!(delay >= expected, "attempt {}: {} < {}", attempt, delay, expected);
            assert!(delay <= expected + expected / 4);
        }
    }

    #[test]
    fn test_capped() {
        let p = policy(1000, 2.0, 4000);
        assert_eq!(backoff_delay(&p, 10, None), Duration::from_millis(4000));
        assert_eq!(
            backoff_delay(&p, 0, Some(Duration::from_secs(30))),
            Duration::from_millis(4000)
        );
    }

    #[test]
    fn test_degenerate_factor() {
        let p = policy(50, 0.0, 1000);
        let delay = backoff_delay(&p, 3, None).as_millis() as u64;
        assert!((50..=62).contains(&delay));
    }
}
