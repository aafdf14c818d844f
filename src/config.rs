//! Exporter configuration.
//!
//! Layered as defaults → TOML file → `BUILDKIT_EXPORTER_*` environment
//! variables (`__` separates sections), then CLI flag overrides applied by
//! [`crate::cli::Cli::apply_overrides`].

use std::collections::HashSet;
use std::path::Path;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::catalog::sanitize_label_name;
use crate::client::BuildkitAddress;
use crate::error::ConfigError;

// ----------------------------------------------------------------------------
// Defaults
// ----------------------------------------------------------------------------

/// Default BuildKit control socket
pub const DEFAULT_BUILDKIT_ADDR: &str = "unix:///run/buildkit/buildkitd.sock";

/// Default listen address for the exposition endpoint
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9220";

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "BUILDKIT_EXPORTER_";

/// Build duration buckets, in seconds
pub const DEFAULT_DURATION_BUCKETS: [f64; 13] = [
    30.0, 60.0, 90.0, 120.0, 180.0, 240.0, 300.0, 450.0, 600.0, 750.0, 900.0, 1050.0, 1200.0,
];

// ============================================================================
// SECTION 1: ROOT CONFIGURATION
// ============================================================================

/// Root configuration for the exporter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// BuildKit connection settings
    #[serde(default)]
    pub buildkit: BuildkitConfig,

    /// HTTP exposition settings
    #[serde(default)]
    pub web: WebConfig,

    /// Metric shaping
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ExporterConfig {
    /// Load configuration from file with environment overrides.
    ///
    /// A missing file is an error; callers that want to fall back to defaults
    /// use [`ExporterConfig::load_or_default`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::extract(Figment::from(Serialized::defaults(Self::default())).merge(Toml::file(path)))
    }

    /// Load from file when present, otherwise from defaults; environment
    /// overrides apply either way.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Self::extract(Figment::from(Serialized::defaults(Self::default())))
        }
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        BuildkitAddress::parse(&self.buildkit.address)
            .map_err(|e| ConfigError::invalid_value("buildkit.address", e.to_string()))?;

        if !self.web.telemetry_path.starts_with('/') || self.web.telemetry_path == "/" {
            return Err(ConfigError::invalid_value(
                "web.telemetry_path",
                "must start with '/' and must not be the root path",
            ));
        }

        if self.web.scrape_timeout_secs == 0 {
            return Err(ConfigError::invalid_value(
                "web.scrape_timeout_secs",
                "must be greater than zero",
            ));
        }

        let buckets = &self.metrics.duration_buckets;
        if buckets.is_empty() {
            return Err(ConfigError::invalid_value(
                "metrics.duration_buckets",
                "at least one bucket is required",
            ));
        }
        if buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::invalid_value(
                "metrics.duration_buckets",
                "buckets must be strictly increasing",
            ));
        }

        let mut seen = HashSet::new();
        for label in &self.metrics.include_labels {
            if label.trim().is_empty() {
                return Err(ConfigError::invalid_value(
                    "metrics.include_labels",
                    "label names must not be empty",
                ));
            }
            if !seen.insert(sanitize_label_name(label)) {
                return Err(ConfigError::invalid_value(
                    "metrics.include_labels",
                    format!("'{}' collides with another included label", label),
                ));
            }
        }

        Ok(())
    }

    /// Render the defaults as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ============================================================================
// SECTION 2: SUB-SECTIONS
// ============================================================================

/// BuildKit connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildkitConfig {
    /// Control API address (`unix://` or `tcp://`)
    #[serde(default = "default_buildkit_addr")]
    pub address: String,

    /// Connection establishment timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Ask BuildKit to close the history stream once all current records
    /// were sent
    #[serde(default = "default_true")]
    pub early_exit: bool,
}

impl Default for BuildkitConfig {
    fn default() -> Self {
        Self {
            address: default_buildkit_addr(),
            connect_timeout_secs: default_connect_timeout(),
            early_exit: true,
        }
    }
}

/// HTTP exposition settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_address: String,

    /// Path under which to expose metrics
    #[serde(default = "default_metrics_path")]
    pub telemetry_path: String,

    /// Upper bound for one scrape; the scrape is cancelled when it elapses
    #[serde(default = "default_scrape_timeout")]
    pub scrape_timeout_secs: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_addr(),
            telemetry_path: default_metrics_path(),
            scrape_timeout_secs: default_scrape_timeout(),
        }
    }
}

/// Metric shaping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Frontend `label:<name>` attributes to copy onto history metrics
    #[serde(default)]
    pub include_labels: Vec<String>,

    /// Histogram buckets for build durations (seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            include_labels: Vec::new(),
            duration_buckets: default_duration_buckets(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_buildkit_addr() -> String {
    DEFAULT_BUILDKIT_ADDR.into()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.into()
}

fn default_metrics_path() -> String {
    "/metrics".into()
}

fn default_scrape_timeout() -> u64 {
    10
}

fn default_duration_buckets() -> Vec<f64> {
    DEFAULT_DURATION_BUCKETS.to_vec()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}
