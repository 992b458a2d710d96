//! Paths exempt from admission control.
//!
//! Operational endpoints (liveness, readiness, metrics scraping) must keep
//! answering while the counter store is down or an organization is over its
//! limit. The rules are checked before any store access.

use std::collections::HashSet;

use crate::config::RateLimitingConfig;

/// Allow-list of exempt paths.
#[derive(Debug, Clone, Default)]
pub struct BypassRules {
    /// Exact path matches
    exact: HashSet<String>,
    /// Prefix matches
    prefixes: Vec<String>,
}

impl BypassRules {
    /// Build rules from explicit lists.
    pub fn new<I, J>(exact: I, prefixes: J) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        J: IntoIterator,
        J::Item: Into<String>,
    {
        Self {
            exact: exact
                .into_iter()
                .map(|p| normalize(&p.into()).to_string())
                .collect(),
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    /// Build rules from the `rate_limiting` configuration section.
    pub fn from_config(config: &RateLimitingConfig) -> Self {
        Self::new(
            config.bypass_paths.iter().cloned(),
            config.bypass_prefixes.iter().cloned(),
        )
    }

    /// Whether `path` skips admission control.
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exact.contains(normalize(path))
            || self.prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Treat `/health/` and `/health` alike.
fn normalize(path: &str) -> &str {
    match path.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => path,
    }
}
