// src/dispatch/policy.rs

//! Retry / timeout / backoff policies and the resolver seam.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::config::model::{PolicyOverride, PolicySettings};

/// Effective execution policy for one command.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Per-attempt timeout; `None` means attempts may run indefinitely.
    pub timeout: Option<Duration>,
    /// Total number of handler invocations allowed (always >= 1).
    pub max_attempts: u32,
    pub retry_on_failure_result: bool,
    pub retry_on_exception: bool,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            max_attempts: 1,
            retry_on_failure_result: false,
            retry_on_exception: true,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            exponential: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self::default()
    }

    /// Delay to sleep after the given (1-based) failed attempt.
    ///
    /// Exponential: `base * 2^(attempt - 1)`; fixed: `base`. Always clamped
    /// to `backoff_max`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay = if self.exponential {
            let exponent = attempt.saturating_sub(1).min(31);
            self.backoff_base
                .checked_mul(1u32 << exponent)
                .unwrap_or(self.backoff_max)
        } else {
            self.backoff_base
        };
        delay.min(self.backoff_max)
    }

    /// Normalise values that would make the attempt loop meaningless.
    pub fn sanitized(mut self) -> Self {
        self.max_attempts = self.max_attempts.max(1);
        if self.timeout == Some(Duration::ZERO) {
            self.timeout = None;
        }
        if self.backoff_max < self.backoff_base {
            self.backoff_max = self.backoff_base;
        }
        self
    }
}

/// Seconds from config as a `Duration`. Negative, NaN or overflowing values
/// fall back to `fallback`.
fn secs_or(value: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(fallback)
}

impl From<&PolicySettings> for RetryPolicy {
    fn from(s: &PolicySettings) -> Self {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            timeout: (s.timeout_secs > 0).then(|| Duration::from_secs(s.timeout_secs)),
            max_attempts: s.max_attempts,
            retry_on_failure_result: s.retry_on_failure_result,
            retry_on_exception: s.retry_on_exception,
            backoff_base: secs_or(s.backoff_base_secs, defaults.backoff_base),
            backoff_max: secs_or(s.backoff_max_secs, defaults.backoff_max),
            exponential: s.exponential,
        }
        .sanitized()
    }
}

/// Resolves the policy for an operation.
///
/// The dispatcher calls this once per command, right before the first
/// attempt.
pub trait PolicyResolver: Send + Sync {
    fn resolve(&self, operation: &str, metadata: &BTreeMap<String, String>) -> RetryPolicy;
}

/// Same policy for every operation.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicyResolver {
    policy: RetryPolicy,
}

impl StaticPolicyResolver {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: policy.sanitized(),
        }
    }
}

impl PolicyResolver for StaticPolicyResolver {
    fn resolve(&self, _operation: &str, _metadata: &BTreeMap<String, String>) -> RetryPolicy {
        self.policy.clone()
    }
}

/// Default policy plus per-operation overrides, usually built from the
/// `[policy]` section of the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigPolicyResolver {
    default: PolicySettings,
    overrides: HashMap<String, PolicyOverride>,
}

impl ConfigPolicyResolver {
    pub fn new(default: PolicySettings, overrides: HashMap<String, PolicyOverride>) -> Self {
        Self { default, overrides }
    }

    pub fn from_config(cfg: &crate::config::ConfigFile) -> Self {
        let overrides = cfg
            .policy
            .operation
            .iter()
            .map(|(name, o)| (name.clone(), o.clone()))
            .collect();
        Self::new(cfg.policy.default.clone(), overrides)
    }
}

impl PolicyResolver for ConfigPolicyResolver {
    fn resolve(&self, operation: &str, _metadata: &BTreeMap<String, String>) -> RetryPolicy {
        match self.overrides.get(operation) {
            Some(o) => RetryPolicy::from(&o.apply_to(&self.default)),
            None => RetryPolicy::from(&self.default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential(base: u64, max: u64) -> RetryPolicy {
        RetryPolicy {
            backoff_base: Duration::from_secs(base),
            backoff_max: Duration::from_secs(max),
            exponential: true,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn exponential_backoff_doubles_until_clamped() {
        let policy = exponential(1, 10);
        // Delay before attempt k (k >= 2) is computed after attempt k - 1
        // and equals min(10, 2^(k-2)).
        for k in 2..=8u32 {
            let expected = Duration::from_secs((1u64 << (k - 2)).min(10));
            assert_eq!(policy.backoff_delay(k - 1), expected, "attempt {k}");
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = exponential(1, 10);
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy {
            backoff_base: Duration::from_millis(250),
            exponential: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(250));
        assert_eq!(policy.backoff_delay(5), Duration::from_millis(250));
    }

    #[test]
    fn sanitized_fixes_degenerate_values() {
        let policy = RetryPolicy {
            timeout: Some(Duration::ZERO),
            max_attempts: 0,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(1),
            ..RetryPolicy::default()
        }
        .sanitized();

        assert_eq!(policy.timeout, None);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff_max, Duration::from_secs(5));
    }

    #[test]
    fn unrepresentable_backoff_falls_back_to_defaults() {
        let settings = PolicySettings {
            backoff_base_secs: -1.0,
            backoff_max_secs: 1e30,
            ..PolicySettings::default()
        };
        let resolver = ConfigPolicyResolver::new(settings, HashMap::new());

        let policy = resolver.resolve("anything", &BTreeMap::new());
        assert_eq!(policy.backoff_base, RetryPolicy::default().backoff_base);
        assert_eq!(policy.backoff_max, RetryPolicy::default().backoff_max);
    }

    #[test]
    fn config_resolver_applies_operation_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "summarize".to_string(),
            PolicyOverride {
                max_attempts: Some(4),
                timeout_secs: Some(30),
                ..PolicyOverride::default()
            },
        );
        let resolver = ConfigPolicyResolver::new(PolicySettings::default(), overrides);
        let meta = BTreeMap::new();

        let tuned = resolver.resolve("summarize", &meta);
        assert_eq!(tuned.max_attempts, 4);
        assert_eq!(tuned.timeout, Some(Duration::from_secs(30)));
        assert_eq!(tuned.retry_on_exception, PolicySettings::default().retry_on_exception);

        let plain = resolver.resolve("mix-audio", &meta);
        assert_eq!(plain, RetryPolicy::from(&PolicySettings::default()));
    }
}
