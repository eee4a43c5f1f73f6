//! Retry policy model and backoff computation.
//!
//! Provides the declarative retry schema shared by every level of the
//! configuration (request, Defaults, top-level StashConfig) and the delay
//! arithmetic consumed by the request executor's retry loop.

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};

/// Multiplier applied between exponential backoff steps when none is configured.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Status codes considered retryable when a policy omits `RetryOnStatus`.
pub const DEFAULT_RETRY_STATUS: &[u16] = &[429, 500, 502, 503, 504];

/// Backoff growth strategy between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Every retry waits `BackoffSeconds`.
    Fixed,
    /// The n-th retry waits `BackoffSeconds * Multiplier^(n-1)`.
    Exponential,
}

/// Jitter mode for a computed backoff delay.
///
/// `true` and `"max"` select full jitter (uniform in `[0, wait]`), `"min"`
/// selects equal jitter (uniform in `[wait/2, wait]`). Any other string is
/// rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Jitter {
    Enabled(bool),
    Mode(JitterMode),
}

/// Named jitter modes accepted as string values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterMode {
    /// Equal jitter: uniform in `[wait/2, wait]`.
    Min,
    /// Full jitter: uniform in `[0, wait]`.
    Max,
}

/// Declarative retry policy as authored in the configuration document.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total number of sends, including the first attempt.
    #[serde(rename = "Attempts")]
    pub attempts: u32,
    /// Backoff growth strategy.
    #[serde(rename = "BackoffStrategy")]
    pub backoff_strategy: BackoffStrategy,
    /// Base delay in seconds before the first retry.
    #[serde(rename = "BackoffSeconds")]
    pub backoff_seconds: f64,
    /// Exponential growth factor (defaults to 2.0).
    #[serde(rename = "Multiplier", default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    /// Upper bound on a single pre-jitter delay.
    #[serde(
        rename = "MaxBackoffSeconds",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_backoff_seconds: Option<f64>,
    /// Budget for the cumulative time across all attempts of one request.
    #[serde(
        rename = "MaxElapsedSeconds",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_elapsed_seconds: Option<f64>,
    /// Jitter applied to each computed delay.
    #[serde(rename = "Jitter", default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<Jitter>,
    /// Status codes that trigger a retry (defaults to [`DEFAULT_RETRY_STATUS`]).
    #[serde(
        rename = "RetryOnStatus",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_on_status: Option<Vec<u16>>,
    /// Whether pre-response network failures are retryable (default true).
    #[serde(
        rename = "RetryOnNetworkErrors",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_on_network_errors: Option<bool>,
    /// Whether client-side timeouts are retryable (default true).
    #[serde(
        rename = "RetryOnTimeouts",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_on_timeouts: Option<bool>,
}

impl RetryPolicy {
    /// Effective exponential multiplier.
    pub fn multiplier(&self) -> f64 {
        self.multiplier.unwrap_or(DEFAULT_MULTIPLIER)
    }

    /// Whether network failures before a response should be retried.
    pub fn retry_on_network_errors(&self) -> bool {
        self.retry_on_network_errors.unwrap_or(true)
    }

    /// Whether client-side timeouts should be retried.
    pub fn retry_on_timeouts(&self) -> bool {
        self.retry_on_timeouts.unwrap_or(true)
    }

    /// Whether a received status code should trigger a retry.
    pub fn retries_status(&self, status: u16) -> bool {
        match &self.retry_on_status {
            Some(codes) => codes.contains(&status),
            None => DEFAULT_RETRY_STATUS.contains(&status),
        }
    }

    /// Pre-jitter delay in seconds for the n-th retry (1-based), capped at
    /// `MaxBackoffSeconds` when configured.
    pub fn backoff_delay(&self, retry_index: u32) -> f64 {
        let delay = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.backoff_seconds,
            BackoffStrategy::Exponential => {
                self.backoff_seconds * self.multiplier().powi(retry_index.saturating_sub(1) as i32)
            }
        };
        let delay = match self.max_backoff_seconds {
            Some(cap) => delay.min(cap),
            None => delay,
        };
        delay.max(0.0)
    }

    /// Delay in seconds for the n-th retry with the configured jitter applied.
    pub fn jittered_delay(&self, retry_index: u32) -> f64 {
        let wait = self.backoff_delay(retry_index);
        match self.jitter {
            Some(Jitter::Enabled(true)) | Some(Jitter::Mode(JitterMode::Max)) => {
                if wait > 0.0 {
                    rand::thread_rng().gen_range(0.0..=wait)
                } else {
                    0.0
                }
            }
            Some(Jitter::Mode(JitterMode::Min)) => {
                if wait > 0.0 {
                    rand::thread_rng().gen_range(wait / 2.0..=wait)
                } else {
                    0.0
                }
            }
            Some(Jitter::Enabled(false)) | None => wait,
        }
    }

    /// Structural checks beyond what the schema types enforce.
    pub fn validate(&self) -> Result<(), String> {
        if self.attempts < 1 {
            return Err("Attempts must be at least 1".to_string());
        }
        if self.backoff_seconds < 0.0 {
            return Err("BackoffSeconds must not be negative".to_string());
        }
        if let Some(m) = self.multiplier {
            if m <= 0.0 {
                return Err("Multiplier must be greater than zero".to_string());
            }
        }
        if let Some(cap) = self.max_backoff_seconds {
            if cap < 0.0 {
                return Err("MaxBackoffSeconds must not be negative".to_string());
            }
        }
        if let Some(budget) = self.max_elapsed_seconds {
            if budget < 0.0 {
                return Err("MaxElapsedSeconds must not be negative".to_string());
            }
        }
        Ok(())
    }
}

/// Authoring state of a `Retry` key at one configuration level.
///
/// An explicit `Retry: null` is semantically different from omitting the key:
/// null disables retries at that level and stops the precedence descent.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RetrySetting {
    /// The `Retry` key was not authored at this level.
    #[default]
    Absent,
    /// The `Retry` key was authored as an explicit null.
    Disabled,
    /// The `Retry` key carries a policy.
    Set(RetryPolicy),
}

impl RetrySetting {
    /// Whether the key was present in the authored mapping, even as null.
    pub fn is_authored(&self) -> bool {
        !matches!(self, RetrySetting::Absent)
    }

    /// The policy carried by this setting, if any.
    pub fn policy(&self) -> Option<&RetryPolicy> {
        match self {
            RetrySetting::Set(policy) => Some(policy),
            _ => None,
        }
    }

    /// Resolves the effective policy across the three configuration levels.
    ///
    /// The descent stops at the first level where the key was authored, even
    /// when its value is null; null (and an entirely unauthored chain) means
    /// retries are disabled.
    pub fn resolve<'a>(
        request: &'a RetrySetting,
        defaults: &'a RetrySetting,
        top: &'a RetrySetting,
    ) -> &'a RetrySetting {
        if request.is_authored() {
            request
        } else if defaults.is_authored() {
            defaults
        } else {
            top
        }
    }
}

/// Deserializes a `Retry` field, mapping a present-but-null value to
/// [`RetrySetting::Disabled`]. Combined with `#[serde(default)]`, an absent
/// key stays [`RetrySetting::Absent`].
pub fn retry_setting<'de, D>(deserializer: D) -> Result<RetrySetting, D::Error>
where
    D: Deserializer<'de>,
{
    let policy = Option::<RetryPolicy>::deserialize(deserializer)?;
    Ok(match policy {
        Some(policy) => RetrySetting::Set(policy),
        None => RetrySetting::Disabled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: BackoffStrategy, base: f64) -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff_strategy: strategy,
            backoff_seconds: base,
            multiplier: None,
            max_backoff_seconds: None,
            max_elapsed_seconds: None,
            jitter: None,
            retry_on_status: None,
            retry_on_network_errors: None,
            retry_on_timeouts: None,
        }
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let p = policy(BackoffStrategy::Fixed, 1.5);
        assert_eq!(p.backoff_delay(1), 1.5);
        assert_eq!(p.backoff_delay(5), 1.5);
    }

    #[test]
    fn test_exponential_backoff_growth() {
        let mut p = policy(BackoffStrategy::Exponential, 1.0);
        p.multiplier = Some(3.0);
        assert_eq!(p.backoff_delay(1), 1.0);
        assert_eq!(p.backoff_delay(2), 3.0);
        assert_eq!(p.backoff_delay(3), 9.0);
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let mut p = policy(BackoffStrategy::Exponential, 1.0);
        p.max_backoff_seconds = Some(5.0);
        assert_eq!(p.backoff_delay(1), 1.0);
        assert_eq!(p.backoff_delay(2), 2.0);
        assert_eq!(p.backoff_delay(4), 5.0);
        assert_eq!(p.backoff_delay(10), 5.0);
    }

    #[test]
    fn test_full_jitter_bounds() {
        let mut p = policy(BackoffStrategy::Fixed, 4.0);
        p.jitter = Some(Jitter::Enabled(true));
        for _ in 0..50 {
            let d = p.jittered_delay(1);
            assert!((0.0..=4.0).contains(&d));
        }
    }

    #[test]
    fn test_equal_jitter_bounds() {
        let mut p = policy(BackoffStrategy::Fixed, 4.0);
        p.jitter = Some(Jitter::Mode(JitterMode::Min));
        for _ in 0..50 {
            let d = p.jittered_delay(1);
            assert!((2.0..=4.0).contains(&d));
        }
    }

    #[test]
    fn test_default_retry_status_set() {
        let p = policy(BackoffStrategy::Fixed, 0.0);
        assert!(p.retries_status(503));
        assert!(p.retries_status(429));
        assert!(!p.retries_status(404));
    }

    #[test]
    fn test_explicit_retry_status_set() {
        let mut p = policy(BackoffStrategy::Fixed, 0.0);
        p.retry_on_status = Some(vec![418]);
        assert!(p.retries_status(418));
        assert!(!p.retries_status(503));
    }

    #[test]
    fn test_precedence_request_wins() {
        let request = RetrySetting::Set(policy(BackoffStrategy::Fixed, 1.0));
        let defaults = RetrySetting::Set(policy(BackoffStrategy::Fixed, 2.0));
        let top = RetrySetting::Set(policy(BackoffStrategy::Fixed, 3.0));
        let effective = RetrySetting::resolve(&request, &defaults, &top);
        assert_eq!(effective.policy().map(|p| p.backoff_seconds), Some(1.0));
    }

    #[test]
    fn test_precedence_explicit_null_stops_descent() {
        let request = RetrySetting::Disabled;
        let defaults = RetrySetting::Set(policy(BackoffStrategy::Fixed, 2.0));
        let top = RetrySetting::Absent;
        let effective = RetrySetting::resolve(&request, &defaults, &top);
        assert!(effective.policy().is_none());
        assert!(effective.is_authored());
    }

    #[test]
    fn test_precedence_falls_through_absent_levels() {
        let request = RetrySetting::Absent;
        let defaults = RetrySetting::Absent;
        let top = RetrySetting::Set(policy(BackoffStrategy::Fixed, 3.0));
        let effective = RetrySetting::resolve(&request, &defaults, &top);
        assert_eq!(effective.policy().map(|p| p.backoff_seconds), Some(3.0));
    }

    #[test]
    fn test_jitter_parses_bool_and_strings() {
        let p: RetryPolicy = serde_yaml::from_str(
            "Attempts: 2\nBackoffStrategy: fixed\nBackoffSeconds: 1\nJitter: min\n",
        )
        .unwrap();
        assert_eq!(p.jitter, Some(Jitter::Mode(JitterMode::Min)));

        let p: RetryPolicy = serde_yaml::from_str(
            "Attempts: 2\nBackoffStrategy: fixed\nBackoffSeconds: 1\nJitter: true\n",
        )
        .unwrap();
        assert_eq!(p.jitter, Some(Jitter::Enabled(true)));

        let err = serde_yaml::from_str::<RetryPolicy>(
            "Attempts: 2\nBackoffStrategy: fixed\nBackoffSeconds: 1\nJitter: sometimes\n",
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut p = policy(BackoffStrategy::Fixed, 1.0);
        p.attempts = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_positive_multiplier() {
        let mut p = policy(BackoffStrategy::Exponential, 1.0);
        p.multiplier = Some(0.0);
        assert!(p.validate().is_err());
    }
}
