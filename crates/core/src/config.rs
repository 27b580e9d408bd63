//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::errors::PoolError;

fn default_weight() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

/// A single RPC provider endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub url: String,
    /// Static selection weight, higher = drawn more often. Must be > 0.
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// RPC provider pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub providers: Vec<ProviderConfig>,
    /// Max distinct providers tried per logical call
    #[serde(default = "PoolConfig::default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "PoolConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Base of the exponential rate-limit backoff
    #[serde(default = "PoolConfig::default_base_backoff_secs")]
    pub base_backoff_secs: f64,
    #[serde(default = "PoolConfig::default_max_backoff_secs")]
    pub max_backoff_secs: f64,
}

impl PoolConfig {
    fn default_max_retries() -> usize {
        3
    }

    fn default_request_timeout_ms() -> u64 {
        10_000
    }

    fn default_base_backoff_secs() -> f64 {
        1.0
    }

    fn default_max_backoff_secs() -> f64 {
        60.0
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Load pool configuration from a JSON file.
    ///
    /// Provider URLs may reference environment variables as `${VAR}`.
    /// Entries whose variables do not resolve are skipped so a missing
    /// API key degrades to a smaller pool instead of a broken URL.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        dotenvy::dotenv().ok();

        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            warn!(path = %path.as_ref().display(), error = %e, "Cannot read pool config");
            PoolError::NoProviders
        })?;
        let mut config: PoolConfig = serde_json::from_str(&raw).map_err(|e| {
            warn!(path = %path.as_ref().display(), error = %e, "Malformed pool config");
            PoolError::NoProviders
        })?;

        config.providers.retain_mut(|p| {
            if !p.enabled {
                return false;
            }
            p.url = substitute_env_vars(&p.url);
            if p.url.contains("${") {
                warn!(provider = %p.name, "Skipping provider with unresolved env var");
                return false;
            }
            true
        });

        if config.providers.is_empty() {
            return Err(PoolError::NoProviders);
        }
        Ok(config)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            providers: vec![],
            max_retries: Self::default_max_retries(),
            request_timeout_ms: Self::default_request_timeout_ms(),
            base_backoff_secs: Self::default_base_backoff_secs(),
            max_backoff_secs: Self::default_max_backoff_secs(),
        }
    }
}

/// Replace `${VAR}` patterns with environment variable values.
/// Unset variables are left in place so the caller can detect them.
fn substitute_env_vars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let var = &rest[start + 2..start + 2 + end];
                match std::env::var(var) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Shared cache store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Canonical cache file path; the lock file sits next to it
    pub path: PathBuf,
    /// Bound on advisory-lock acquisition before proceeding lockless
    #[serde(default = "CacheConfig::default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Ring-buffer depth per price history
    #[serde(default = "CacheConfig::default_history_depth")]
    pub history_depth: usize,
    /// Atomic-rename retry budget for transient failures
    #[serde(default = "CacheConfig::default_rename_retries")]
    pub rename_retries: usize,
    #[serde(default = "CacheConfig::default_rename_retry_delay_ms")]
    pub rename_retry_delay_ms: u64,
}

impl CacheConfig {
    fn default_lock_timeout_ms() -> u64 {
        200
    }

    fn default_history_depth() -> usize {
        200
    }

    fn default_rename_retries() -> usize {
        5
    }

    fn default_rename_retry_delay_ms() -> u64 {
        50
    }

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout_ms: Self::default_lock_timeout_ms(),
            history_depth: Self::default_history_depth(),
            rename_retries: Self::default_rename_retries(),
            rename_retry_delay_ms: Self::default_rename_retry_delay_ms(),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Default per-namespace staleness thresholds, in seconds.
/// Callers supply `max_age` at read time; these are the conventional values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessDefaults {
    pub prices: f64,
    pub market_data: f64,
    pub wallet: f64,
    pub safety: f64,
    pub regime: f64,
    pub trust_scores: f64,
    pub active_positions: f64,
}

impl Default for StalenessDefaults {
    fn default() -> Self {
        Self {
            prices: 30.0,
            market_data: 300.0,
            wallet: 60.0,
            safety: 3600.0,
            regime: 300.0,
            trust_scores: 600.0,
            active_positions: 30.0,
        }
    }
}
