//! Exponential retry backoff.

use std::time::Duration;

use berth_core::RecoveryConfig;
use berth_state::ErrorKind;

/// Delay before retry number `retry_count` (zero-based):
/// `min(base · 2^n, max)`, and for network errors that value times the
/// network multiplier, capped again.
pub fn backoff_delay(kind: ErrorKind, retry_count: u32, config: &RecoveryConfig) -> Duration {
    let cap = config.max_delay;
    let exp = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
    let delay = config.base_delay.checked_mul(exp).unwrap_or(cap).min(cap);
    match kind {
        ErrorKind::Network => delay
            .checked_mul(config.network_multiplier)
            .unwrap_or(cap)
            .min(cap),
        _ => delay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(kind: ErrorKind, n: u32) -> u128 {
        backoff_delay(kind, n, &RecoveryConfig::default()).as_millis()
    }

    #[test]
    fn timeout_backoff_doubles_to_cap() {
        let delays: Vec<u128> = (0..7).map(|n| ms(ErrorKind::Timeout, n)).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn network_backoff_is_doubled_then_capped() {
        let delays: Vec<u128> = (0..5).map(|n| ms(ErrorKind::Network, n)).collect();
        assert_eq!(delays, vec![2000, 4000, 8000, 16000, 30000]);
    }

    #[test]
    fn large_retry_counts_do_not_overflow() {
        assert_eq!(ms(ErrorKind::Timeout, 64), 30000);
        assert_eq!(ms(ErrorKind::Network, u32::MAX), 30000);
    }

    #[test]
    fn every_attempt_matches_closed_form() {
        for n in 0..20u32 {
            let expected = (1000u128 * 2u128.pow(n)).min(30000);
            assert_eq!(ms(ErrorKind::Timeout, n), expected, "attempt {n}");
            assert_eq!(ms(ErrorKind::Network, n), (expected * 2).min(30000), "attempt {n}");
        }
    }
}
