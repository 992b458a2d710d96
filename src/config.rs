//! Configuration management for Tollgate.
//!
//! Sources, lowest precedence first: built-in defaults, an optional YAML
//! file, then `TOLLGATE__`-prefixed environment variables using `__` as the
//! nesting separator (`TOLLGATE__RATE_LIMITING__LIMIT=100`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::ratelimit::{Quota, DEFAULT_KEY_PREFIX, DEFAULT_STORE_TIMEOUT};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission control configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Shared counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests per window per organization
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Quotas for organization tiers, keyed by tier name
    #[serde(default)]
    pub tiers: HashMap<String, QuotaConfig>,

    /// Prefix for counter keys in the shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Paths exempt from admission control (exact match)
    #[serde(default = "default_bypass_paths")]
    pub bypass_paths: Vec<String>,

    /// Path prefixes exempt from admission control
    #[serde(default)]
    pub bypass_prefixes: Vec<String>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_secs: default_window_secs(),
            tiers: HashMap::new(),
            key_prefix: default_key_prefix(),
            bypass_paths: default_bypass_paths(),
            bypass_prefixes: Vec::new(),
        }
    }
}

fn default_limit() -> u64 {
    60
}

fn default_window_secs() -> u64 {
    60
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_bypass_paths() -> Vec<String> {
    ["/health", "/healthz", "/livez", "/readyz", "/metrics"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

/// A quota for one tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Requests per window
    pub limit: u64,
    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

/// Which counter store backs admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis server (multi-process deployments)
    #[default]
    Redis,
    /// Process-local memory (single instance, development)
    Memory,
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Timeout for one admission check's store round trip, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// The store timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT.as_millis() as u64
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl GatewayConfig {
    /// Load configuration from defaults, an optional file, and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: GatewayConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string, ignoring the environment.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatewayConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make admission control meaningless.
    ///
    /// Runs once at startup so misconfiguration never surfaces per request.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;

        Quota::new(rl.limit, Duration::from_secs(rl.window_secs))?;
        for (tier, quota) in &rl.tiers {
            Quota::new(quota.limit, Duration::from_secs(quota.window_secs))
                .map_err(|e| GatewayError::Config(format!("tier '{}': {}", tier, e)))?;
        }

        if rl.key_prefix.trim().is_empty() {
            return Err(GatewayError::Config("key_prefix must not be empty".to_string()));
        }

        if let Some(bad) = rl
            .bypass_paths
            .iter()
            .chain(rl.bypass_prefixes.iter())
            .find(|p| !p.starts_with('/'))
        {
            return Err(GatewayError::Config(format!(
                "bypass path '{}' must start with '/'",
                bad
            )));
        }

        if self.store.timeout_ms == 0 {
            return Err(GatewayError::Config(
                "store timeout_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
