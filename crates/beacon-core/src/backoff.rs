//! Capped exponential backoff.
//!
//! Pure math only; the broker supervisor supplies randomness and sleeps.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
/// Default delay cap in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Backoff parameters for reconnection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Symmetric jitter range around the capped delay.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (zero-based).
    ///
    /// `random` must be in `[0.0, 1.0)`.
    pub fn delay(&self, attempt: u32, random: f64) -> Duration {
        Duration::from_millis(calculate_backoff_delay_with_random(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
            random,
        ))
    }
}

/// `min(max_delay, base_delay * 2^attempt) * (1 ± jitter)`.
///
/// `random` in `[0, 1)` maps to `[-jitter, +jitter]`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn calculate_backoff_delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_delay_ms);

    let jitter = 1.0 + (random * 2.0 - 1.0) * jitter_factor.clamp(0.0, 1.0);
    ((capped as f64) * jitter).round().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midpoint_random_has_no_jitter() {
        assert_eq!(calculate_backoff_delay_with_random(0, 500, 30_000, 0.2, 0.5), 500);
        assert_eq!(calculate_backoff_delay_with_random(3, 500, 30_000, 0.2, 0.5), 4000);
    }

    #[test]
    fn delay_is_capped() {
        assert_eq!(calculate_backoff_delay_with_random(20, 500, 30_000, 0.0, 0.9), 30_000);
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let d = calculate_backoff_delay_with_random(u32::MAX, u64::MAX, u64::MAX, 0.0, 0.0);
        assert_eq!(d, u64::MAX as f64 as u64);
    }

    #[test]
    fn jitter_stays_in_range() {
        let low = calculate_backoff_delay_with_random(2, 1000, 60_000, 0.2, 0.0);
        let high = calculate_backoff_delay_with_random(2, 1000, 60_000, 0.2, 0.999_999);
        assert_eq!(low, 3200);
        assert!(high <= 4800 && high > 4700);
    }

    #[test]
    fn config_defaults_from_empty_json() {
        let cfg: BackoffConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, BackoffConfig::default());
    }

    #[test]
    fn config_delay_uses_fields() {
        let cfg = BackoffConfig {
            base_delay_ms: 100,
            max_delay_ms: 250,
            jitter_factor: 0.0,
        };
        assert_eq!(cfg.delay(0, 0.3), Duration::from_millis(100));
        assert_eq!(cfg.delay(5, 0.3), Duration::from_millis(250));
    }
}
