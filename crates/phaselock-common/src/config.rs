//! Configuration structures for a periodic alarm loop.
//!
//! Supports TOML deserialization with defaults matching the classic 20 ms
//! control-loop cadence.

use crate::error::{PhaselockError, PhaselockResult};
use crate::time::Period;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Default loop period.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(20);

/// Top-level loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Tick period.
    #[serde(with = "humantime_serde")]
    pub period: Duration,

    /// Signed offset of the tick grid from the start epoch, in microseconds.
    ///
    /// Negative values pre-bias ticks to absorb known callback latency.
    /// Must be smaller in magnitude than `period`: an offset of a whole
    /// period or more lands on the same grid as `offset_us % period` and is
    /// rejected by [`LoopConfig::validated_period`] as a likely unit mistake.
    /// The loop builder itself accepts any offset.
    pub offset_us: i64,

    /// Name registered with the platform alarm.
    pub alarm_name: String,

    /// Stop after this many ticks (0 = run until stopped).
    pub max_ticks: u64,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            offset_us: 0,
            alarm_name: String::from("PeriodicLoop"),
            max_ticks: 0,
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Size of the wake-latency ring buffer.
    pub histogram_size: usize,

    /// Wake latency above which a tick is counted as late.
    #[serde(with = "humantime_serde")]
    pub late_threshold: Duration,

    /// Ticks between periodic status log lines (0 disables).
    pub status_interval: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            histogram_size: 10_000,
            late_threshold: Duration::from_millis(1),
            status_interval: 500,
        }
    }
}

impl LoopConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        debug!(?path, "Reading loop configuration");
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate the configured period.
    ///
    /// # Errors
    ///
    /// Returns [`PhaselockError::InvalidPeriod`] for a zero period and
    /// [`PhaselockError::Config`] when the offset is not smaller in magnitude
    /// than the period.
    pub fn validated_period(&self) -> PhaselockResult<Period> {
        let period = Period::try_from(self.period)?;
        if self.offset_us.unsigned_abs() >= period.as_micros().unsigned_abs() {
            return Err(PhaselockError::Config(format!(
                "offset {}us must be smaller in magnitude than period {period}",
                self.offset_us
            )));
        }
        Ok(period)
    }

    /// Late threshold in whole microseconds.
    #[must_use]
    pub fn late_threshold_us(&self) -> u64 {
        u64::try_from(self.metrics.late_threshold.as_micros()).unwrap_or(u64::MAX)
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
