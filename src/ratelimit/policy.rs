//! Admission quotas and tier resolution.
//!
//! A policy is immutable once built: one default quota for every
//! organization plus optional per-tier overrides. Changing it requires a
//! restart.

use std::collections::HashMap;
use std::time::Duration;

use tracing::info;

use crate::config::RateLimitingConfig;
use crate::error::{GatewayError, Result};

/// Longest accepted window. Longer windows would overflow timestamp and
/// expiry arithmetic, making every check fail.
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Requests allowed per fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    limit: u64,
    window: Duration,
}

impl Quota {
    /// Create a quota, rejecting a zero limit or a window outside 1ms..=[`MAX_WINDOW`].
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(GatewayError::Config(
                "rate limit must be a positive number of requests".to_string(),
            ));
        }
        if window.as_millis() == 0 {
            return Err(GatewayError::Config(
                "rate limit window must be at least one millisecond".to_string(),
            ));
        }
        if window > MAX_WINDOW {
            return Err(GatewayError::Config(format!(
                "rate limit window must not exceed {} seconds",
                MAX_WINDOW.as_secs()
            )));
        }
        Ok(Self { limit, window })
    }

    /// Maximum admissions per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Length of one window.
    pub fn window(&self) -> Duration {
        self.window
    }
}

/// The process-wide admission policy.
#[derive(Debug, Clone)]
pub struct Policy {
    default: Quota,
    tiers: HashMap<String, Quota>,
}

impl Policy {
    /// A policy with a single quota for everyone.
    pub fn new(default: Quota) -> Self {
        Self {
            default,
            tiers: HashMap::new(),
        }
    }

    /// Add or replace the quota for a tier.
    pub fn with_tier(mut self, tier: impl Into<String>, quota: Quota) -> Self {
        self.tiers.insert(tier.into(), quota);
        self
    }

    /// Build the policy from the `rate_limiting` configuration section.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let default = Quota::new(config.limit, Duration::from_secs(config.window_secs))?;
        let mut policy = Policy::new(default);

        for (tier, quota) in &config.tiers {
            let quota = Quota::new(quota.limit, Duration::from_secs(quota.window_secs))
                .map_err(|e| GatewayError::Config(format!("tier '{}': {}", tier, e)))?;
            policy = policy.with_tier(tier.clone(), quota);
        }

        info!(
            limit = default.limit,
            window_secs = default.window.as_secs(),
            tiers = policy.tiers.len(),
            "Admission policy loaded"
        );

        Ok(policy)
    }

    /// The default quota.
    pub fn default_quota(&self) -> Quota {
        self.default
    }

    /// Resolve the quota for an organization's tier.
    ///
    /// Unknown or absent tiers fall back to the default quota.
    pub fn quota_for(&self, tier: Option<&str>) -> Quota {
        tier.and_then(|t| self.tiers.get(t))
            .copied()
            .unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaConfig;

    #[test]
    fn test_quota_rejects_zero_limit() {
        let err = Quota::new(0, Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_quota_rejects_zero_window() {
        assert!(Quota::new(10, Duration::ZERO).is_err());
        assert!(Quota::new(10, Duration::from_micros(500)).is_err());
    }

    #[test]
    fn test_quota_rejects_oversized_window() {
        assert!(Quota::new(10, MAX_WINDOW).is_ok());
        assert!(Quota::new(10, MAX_WINDOW + Duration::from_secs(1)).is_err());
        assert!(Quota::new(10, Duration::from_secs(u64::MAX)).is_err());
    }

    #[test]
    fn test_quota_for_falls_back_to_default() {
        let default = Quota::new(100, Duration::from_secs(60)).unwrap();
        let premium = Quota::new(5000, Duration::from_secs(60)).unwrap();
        let policy = Policy::new(default).with_tier("premium", premium);

        assert_eq!(policy.quota_for(None), default);
        assert_eq!(policy.quota_for(Some("premium")), premium);
        assert_eq!(policy.quota_for(Some("unknown")), default);
    }

    #[test]
    fn test_from_config_with_tiers() {
        let mut config = RateLimitingConfig::default();
        config.limit = 10;
        config.window_secs = 30;
        config.tiers.insert(
            "enterprise".to_string(),
            QuotaConfig {
                limit: 1000,
                window_secs: 60,
            },
        );

        let policy = Policy::from_config(&config).unwrap();
        assert_eq!(policy.default_quota().limit(), 10);
        assert_eq!(policy.default_quota().window(), Duration::from_secs(30));

        let enterprise = policy.quota_for(Some("enterprise"));
        assert_eq!(enterprise.limit(), 1000);
        assert_eq!(enterprise.window(), Duration::from_secs(60));
    }

    #[test]
    fn test_from_config_rejects_bad_tier() {
        let mut config = RateLimitingConfig::default();
        config.tiers.insert(
            "broken".to_string(),
            QuotaConfig {
                limit: 0,
                window_secs: 60,
            },
        );

        let err = Policy::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
