// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retry classification and backoff.

use helm_config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Message fragments that mark a failure as transient.
const TRANSIENT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "429",
    "500",
    "502",
    "503",
    "504",
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "network",
    "overloaded",
];

/// Whether an upstream failure message belongs to the transient class.
#[must_use]
pub fn is_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Delay before retry attempt `attempt` (0-based): `min(base·2^attempt, max)`
/// plus/minus the configured jitter fraction.
#[must_use]
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = config
        .base_delay_ms
        .saturating_mul(1u64 << attempt.min(20))
        .min(config.max_delay_ms);
    if config.jitter <= 0.0 {
        return Duration::from_millis(exp);
    }
    let spread = (exp as f64 * config.jitter).round() as i64;
    let offset = if spread > 0 {
        rand::thread_rng().gen_range(-spread..=spread)
    } else {
        0
    };
    Duration::from_millis((exp as i64 + offset).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_messages_are_retryable() {
        for message in [
            "HTTP 429 Too Many Requests",
            "rate limit exceeded",
            "HTTP 503 from upstream",
            "request timed out after 30s",
            "connection reset by peer",
        ] {
            assert!(is_retryable(message), "{message}");
        }
    }

    #[test]
    fn permanent_messages_are_not() {
        for message in [
            "HTTP 401 unauthorized",
            "HTTP 400 bad request: invalid model",
            "unknown model 'x'",
        ] {
            assert!(!is_retryable(message), "{message}");
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 400,
            jitter: 0.0,
        };
        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(&config, 6), Duration::from_millis(400), "capped");
    }

    #[test]
    fn jitter_stays_within_band() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
            jitter: 0.2,
        };
        for _ in 0..50 {
            let delay = backoff_delay(&config, 0).as_millis() as i64;
            assert!((800..=1_200).contains(&delay), "delay {delay} outside band");
        }
    }
}
