//! # Gateway Config
//!
//! Configuration management for the completion gateway.
//!
//! This crate provides:
//! - A single [`GatewayConfig`] aggregating every component's settings
//! - YAML, TOML or JSON files chosen by extension
//! - `GATEWAY_*` environment overrides
//! - Cross-field validation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use gateway_core::MAX_FRAG_SEQ;
use gateway_flow::{AckConfig, RetransmitConfig, WatermarkConfig, WindowUpdateConfig};
use gateway_resilience::{AnomalyConfig, BudgetConfig, CircuitBreakerConfig};
use gateway_routing::{AgentStatusConfig, SchedulerConfig};
use gateway_telemetry::{LogFormat, LoggingConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG";

/// Config file used when `GATEWAY_CONFIG` is not set
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Config file could not be parsed
    #[error("Failed to parse config file {path}: {message}")]
    Parse {
        /// File path
        path: PathBuf,
        /// Parser message
        message: String,
    },
    /// Unsupported file extension
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),
    /// Environment override has an invalid value
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv {
        /// Variable name
        var: String,
        /// Offending value
        value: String,
    },
    /// Configuration values are inconsistent
    #[error("Invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Token estimate charged against windows and budgets before a call
    pub estimated_tokens: u64,
    /// Cost estimate charged before a call, in micro-dollars
    pub estimated_usd_micros: u64,
    /// Upper bound for a single backend call
    #[serde(with = "humantime_serde")]
    pub backend_timeout: Duration,
    /// Per-session admission state untouched for this long is purged
    #[serde(with = "humantime_serde")]
    pub session_idle_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            estimated_tokens: 1_000,
            estimated_usd_micros: 2_000,
            backend_timeout: Duration::from_secs(30),
            session_idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Logging
    pub logging: LoggingConfig,
    /// Fragment acknowledgement
    pub ack: AckConfig,
    /// Selective retransmission
    pub retransmit: RetransmitConfig,
    /// Window update cadence
    pub window_update: WindowUpdateConfig,
    /// Backpressure watermarks
    pub backpressure: WatermarkConfig,
    /// Agent status overrides
    pub agent_status: AgentStatusConfig,
    /// Fair scheduler
    pub scheduler: SchedulerConfig,
    /// Token and cost budgets
    pub budget: BudgetConfig,
    /// Burn-rate anomaly detection
    pub anomaly: AnomalyConfig,
    /// Circuit breakers
    pub circuit_breaker: CircuitBreakerConfig,
    /// Dispatch estimates and timeouts
    pub dispatch: DispatchConfig,
}

impl GatewayConfig {
    /// Parse configuration text in the given format (`yaml`, `yml`, `toml`, `json`)
    ///
    /// # Errors
    /// Returns error if the format is unknown or the text does not parse
    pub fn from_str_with_format(content: &str, format: &str, origin: &Path) -> ConfigResult<Self> {
        let parse_err = |message: String| ConfigError::Parse {
            path: origin.to_path_buf(),
            message,
        };
        match format.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => serde_yaml::from_str(content).map_err(|e| parse_err(e.to_string())),
            "toml" => toml::from_str(content).map_err(|e| parse_err(e.to_string())),
            "json" => serde_json::from_str(content).map_err(|e| parse_err(e.to_string())),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Apply `GATEWAY_*` overrides from the process environment
    ///
    /// # Errors
    /// Returns error if a numeric override does not parse
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply `GATEWAY_*` overrides looked up through `lookup`
    ///
    /// # Errors
    /// Returns error if an override does not parse
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("GATEWAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("GATEWAY_LOG_FORMAT") {
            self.logging.format = format.parse::<LogFormat>().map_err(|_| ConfigError::InvalidEnv {
                var: "GATEWAY_LOG_FORMAT".to_string(),
                value: format.clone(),
            })?;
        }
        if let Some(capacity) = lookup("GATEWAY_SCHEDULER_CAPACITY") {
            self.scheduler.capacity = parse_env("GATEWAY_SCHEDULER_CAPACITY", &capacity)?;
        }
        if let Some(threshold) = lookup("GATEWAY_BREAKER_FAIL_THRESHOLD") {
            self.circuit_breaker.failure_threshold =
                parse_env("GATEWAY_BREAKER_FAIL_THRESHOLD", &threshold)?;
        }
        Ok(())
    }

    /// Check cross-field consistency
    ///
    /// # Errors
    /// Returns every violated rule at once
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        let bp = &self.backpressure;
        if bp.low_ms > bp.high_ms {
            errors.push(format!(
                "backpressure.low_ms ({}) must not exceed backpressure.high_ms ({})",
                bp.low_ms, bp.high_ms
            ));
        }
        if bp.require_n == 0 {
            errors.push("backpressure.require_n must be at least 1".to_string());
        }

        let ack = &self.ack;
        if ack.max_fragments == 0 || u64::from(ack.max_fragments) > u64::from(MAX_FRAG_SEQ) + 1 {
            errors.push(format!(
                "ack.max_fragments ({}) must be between 1 and {}",
                ack.max_fragments,
                u64::from(MAX_FRAG_SEQ) + 1
            ));
        }
        if ack.max_nacks == 0 {
            errors.push("ack.max_nacks must be at least 1".to_string());
        }
        if self.retransmit.ttl.is_zero() {
            errors.push("retransmit.ttl must be greater than zero".to_string());
        }

        let sched = &self.scheduler;
        if sched.capacity == 0 {
            errors.push("scheduler.capacity must be at least 1".to_string());
        }
        if sched.per_session_limit == 0 {
            errors.push("scheduler.per_session_limit must be at least 1".to_string());
        }
        if !(sched.default_weight > 0.0 && sched.default_weight.is_finite()) {
            errors.push("scheduler.default_weight must be positive".to_string());
        }
        let mut bad_weights: Vec<&String> = sched
            .weights
            .iter()
            .filter(|(_, w)| !(**w > 0.0 && w.is_finite()))
            .map(|(s, _)| s)
            .collect();
        bad_weights.sort();
        for session in bad_weights {
            errors.push(format!("scheduler.weights.{session} must be positive"));
        }

        let anomaly = &self.anomaly;
        if !(anomaly.alpha > 0.0 && anomaly.alpha <= 1.0) {
            errors.push(format!("anomaly.alpha ({}) must be in (0, 1]", anomaly.alpha));
        }
        if anomaly.min_samples < 2 {
            errors.push("anomaly.min_samples must be at least 2".to_string());
        }
        if anomaly.max_samples < anomaly.min_samples {
            errors.push(format!(
                "anomaly.max_samples ({}) must be at least anomaly.min_samples ({})",
                anomaly.max_samples, anomaly.min_samples
            ));
        }

        if self.circuit_breaker.failure_threshold == 0 {
            errors.push("circuit_breaker.failure_threshold must be at least 1".to_string());
        }
        if self.circuit_breaker.success_threshold == 0 {
            errors.push("circuit_breaker.success_threshold must be at least 1".to_string());
        }
        if self.dispatch.session_idle_timeout.is_zero() {
            errors.push("dispatch.session_idle_timeout must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

/// Builder that resolves, parses, overrides and validates configuration
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    required: bool,
    env_overrides: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a loader for the default file with environment overrides
    #[must_use]
    pub fn new() -> Self {
        Self {
            file: None,
            required: false,
            env_overrides: true,
        }
    }

    /// Load from an explicit file, which must exist
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self.required = true;
        self
    }

    /// Enable or disable `GATEWAY_*` environment overrides
    #[must_use]
    pub fn with_env_overrides(mut self, enabled: bool) -> Self {
        self.env_overrides = enabled;
        self
    }

    /// Load the configuration
    ///
    /// Without an explicit file, `GATEWAY_CONFIG` or `config/gateway.yaml`
    /// is used when present; otherwise defaults apply.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, an override is
    /// malformed, or validation fails
    pub fn load(&self) -> ConfigResult<GatewayConfig> {
        let (path, required) = match &self.file {
            Some(path) => (path.clone(), self.required),
            None => match std::env::var(CONFIG_PATH_ENV) {
                Ok(path) => (PathBuf::from(path), true),
                Err(_) => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
            },
        };

        let mut config = if path.exists() || required {
            load_from_path(&path)?
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            GatewayConfig::default()
        };

        if self.env_overrides {
            config.apply_env_overrides()?;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Parse a config file, choosing the format by extension
///
/// # Errors
/// Returns error if the file cannot be read or parsed
pub fn load_from_path(path: &Path) -> ConfigResult<GatewayConfig> {
    let format = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_string();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = GatewayConfig::from_str_with_format(&content, &format, path)?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

/// Load configuration from the default locations with environment overrides
///
/// # Errors
/// See [`ConfigLoader::load`]
pub fn load_config() -> ConfigResult<GatewayConfig> {
    ConfigLoader::new().load()
}
