//! Process settings for the inference server.
//!
//! Provides [`InferSettings`], loaded from TOML files, environment variables
//! and defaults using the `confyg` crate. Settings are built once at startup
//! and handed to each component; nothing reads them from a global.
//!
//! # Loading Priority
//!
//! 1. Explicit config path
//! 2. `INFER_CONFIG` environment variable
//! 3. XDG default: `~/.config/infer/config.toml`
//! 4. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use confyg::{Confygery, env};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ============================================================================
// Configuration structs
// ============================================================================

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferSettings {
    /// Per-front-end deadlines.
    pub dispatch: DispatchSettings,

    /// Circuit breaker policy and degraded workload bounds.
    pub breaker: BreakerSettings,

    /// Response/feature cache.
    pub cache: CacheSettings,

    /// Feature assembly.
    pub features: FeatureSettings,

    /// Tensor inference client.
    pub inference: InferenceSettings,

    /// Vector search and result formatting.
    pub search: SearchSettings,
}

/// Deadlines owned by each protocol front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Deadline of the gRPC front end, in milliseconds.
    pub grpc_deadline_ms: u64,

    /// Deadline of the Dubbo front end, in milliseconds.
    pub dubbo_deadline_ms: u64,
}

/// Circuit breaker policy.
///
/// The breaker opens when either `consecutive_failures` primary calls fail in
/// a row, or the success rate over `window_secs` drops below
/// `required_success_rate` once at least `min_request_volume` calls were seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker.
    pub consecutive_failures: u32,

    /// Required success rate over the rolling window (0.0 to 1.0).
    pub required_success_rate: f64,

    /// Calls needed in the window before the success rate is evaluated.
    pub min_request_volume: u32,

    /// Rolling window length, in seconds.
    pub window_secs: u64,

    /// How long the breaker stays open before probing again, in milliseconds.
    pub sleep_window_ms: u64,

    /// Primary calls slower than this count as failures, in milliseconds.
    pub primary_timeout_ms: u64,

    /// Recall count used by the degraded path.
    pub lower_recall_num: u32,

    /// Candidate item cap used by the degraded path.
    pub lower_rank_num: usize,
}

/// TTL cache settings. A zero life window disables caching entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Entry lifetime, in seconds.
    pub life_window_secs: u64,

    /// Interval between expiry sweeps, in seconds.
    pub clean_window_secs: u64,

    /// Largest single entry accepted, in bytes.
    pub max_entry_size: usize,

    /// Upper bound on total cached bytes, in megabytes (0 = unbounded).
    pub hard_max_cache_size_mb: usize,
}

/// Feature assembly settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSettings {
    /// Local fan-in timeout for all lookups, in milliseconds.
    pub assembly_timeout_ms: u64,

    /// Per-read timeout against the feature store, in milliseconds.
    pub store_read_timeout_ms: u64,

    /// Target false-positive rate of the existence filters.
    pub filter_false_positive_rate: f64,
}

/// Tensor inference client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    /// Model version to request; `None` serves the latest.
    pub model_version: Option<i64>,

    /// Prediction call timeout, in milliseconds.
    pub timeout_ms: u64,

    /// Connections in the prediction pool.
    pub pool_size: usize,

    /// Time allowed to acquire a pooled connection, in milliseconds.
    pub acquire_timeout_ms: u64,
}

/// Vector search and formatting settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Local gather timeout across index shards, in milliseconds.
    pub gather_timeout_ms: u64,

    /// Local timeout for result formatting, in milliseconds.
    pub format_timeout_ms: u64,
}

// ============================================================================
// Default implementations
// ============================================================================

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            grpc_deadline_ms: 150,
            dubbo_deadline_ms: 100,
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            consecutive_failures: 5,
            required_success_rate: 0.5,
            min_request_volume: 20,
            window_secs: 10,
            sleep_window_ms: 5_000,
            primary_timeout_ms: 100,
            lower_recall_num: 100,
            lower_rank_num: 100,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            life_window_secs: 0,
            clean_window_secs: 60,
            max_entry_size: 1024 * 1024,
            hard_max_cache_size_mb: 256,
        }
    }
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            assembly_timeout_ms: 100,
            store_read_timeout_ms: 50,
            filter_false_positive_rate: 0.001,
        }
    }
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            model_version: None,
            timeout_ms: 80,
            pool_size: 16,
            acquire_timeout_ms: 10,
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            gather_timeout_ms: 100,
            format_timeout_ms: 100,
        }
    }
}

// ============================================================================
// Duration accessors
// ============================================================================

impl DispatchSettings {
    /// Deadline of the gRPC front end.
    pub fn grpc_deadline(&self) -> Duration {
        Duration::from_millis(self.grpc_deadline_ms)
    }

    /// Deadline of the Dubbo front end.
    pub fn dubbo_deadline(&self) -> Duration {
        Duration::from_millis(self.dubbo_deadline_ms)
    }
}

impl BreakerSettings {
    /// Rolling window length.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Open-state duration before a probe is allowed.
    pub fn sleep_window(&self) -> Duration {
        Duration::from_millis(self.sleep_window_ms)
    }

    /// Primary computation timeout.
    pub fn primary_timeout(&self) -> Duration {
        Duration::from_millis(self.primary_timeout_ms)
    }
}

impl CacheSettings {
    /// Entry lifetime.
    pub fn life_window(&self) -> Duration {
        Duration::from_secs(self.life_window_secs)
    }

    /// Sweep interval.
    pub fn clean_window(&self) -> Duration {
        Duration::from_secs(self.clean_window_secs)
    }

    /// Whether caching is enabled at all.
    pub fn is_enabled(&self) -> bool {
        self.life_window_secs > 0
    }

    /// Hard size bound in bytes, `None` when unbounded.
    pub fn hard_max_bytes(&self) -> Option<usize> {
        (self.hard_max_cache_size_mb > 0).then(|| self.hard_max_cache_size_mb * 1024 * 1024)
    }
}

impl FeatureSettings {
    /// Local fan-in timeout.
    pub fn assembly_timeout(&self) -> Duration {
        Duration::from_millis(self.assembly_timeout_ms)
    }

    /// Per-read store timeout.
    pub fn store_read_timeout(&self) -> Duration {
        Duration::from_millis(self.store_read_timeout_ms)
    }
}

impl InferenceSettings {
    /// Prediction call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Pool acquisition timeout.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl SearchSettings {
    /// Gather timeout across shards.
    pub fn gather_timeout(&self) -> Duration {
        Duration::from_millis(self.gather_timeout_ms)
    }

    /// Formatting timeout.
    pub fn format_timeout(&self) -> Duration {
        Duration::from_millis(self.format_timeout_ms)
    }
}

// ============================================================================
// Loading
// ============================================================================

impl InferSettings {
    /// Load settings from file, environment, and defaults.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder =
            Confygery::new().map_err(|e| Error::config(format!("config init: {e}")))?;

        if let Some(path) = Self::resolve_config_path(config_path) {
            if path.exists() {
                builder
                    .add_file(&path.to_string_lossy())
                    .map_err(|e| Error::config(format!("config file: {e}")))?;
            }
        }

        let mut env_opts = env::Options::with_top_level("INFER");
        env_opts.add_section("dispatch");
        env_opts.add_section("breaker");
        env_opts.add_section("cache");
        env_opts.add_section("features");
        env_opts.add_section("inference");
        env_opts.add_section("search");
        builder
            .add_env(env_opts)
            .map_err(|e| Error::config(format!("config env: {e}")))?;

        let settings: Self = builder
            .build()
            .map_err(|e| Error::config(format!("config build: {e}")))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings: Self = toml::from_str(raw).map_err(|e| Error::config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Resolve the config file path from explicit path, env var, or XDG default.
    pub fn resolve_config_path(explicit: Option<&str>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("INFER_CONFIG") {
            return Some(PathBuf::from(path));
        }

        dirs::config_dir().map(|d| d.join("infer").join("config.toml"))
    }

    /// Serialize these settings to a pretty-printed TOML string.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    /// Reject settings the pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        let rate = self.features.filter_false_positive_rate;
        if !(rate > 0.0 && rate < 1.0) {
            return Err(Error::config(format!(
                "features.filter_false_positive_rate must be in (0, 1), got {rate}"
            )));
        }

        let success = self.breaker.required_success_rate;
        if !(0.0..=1.0).contains(&success) {
            return Err(Error::config(format!(
                "breaker.required_success_rate must be in [0, 1], got {success}"
            )));
        }

        if self.breaker.consecutive_failures == 0 {
            return Err(Error::config("breaker.consecutive_failures must be > 0"));
        }

        if self.breaker.lower_rank_num == 0 {
            return Err(Error::config(
                "breaker.lower_rank_num must be > 0 so degraded rank keeps a candidate",
            ));
        }

        if self.inference.pool_size == 0 {
            return Err(Error::config("inference.pool_size must be > 0"));
        }

        let deadline = self
            .dispatch
            .grpc_deadline_ms
            .max(self.dispatch.dubbo_deadline_ms);
        if self.inference.timeout_ms > deadline {
            tracing::warn!(
                inference_timeout_ms = self.inference.timeout_ms,
                deadline_ms = deadline,
                "inference timeout exceeds every dispatch deadline"
            );
        }

        Ok(())
    }
}
