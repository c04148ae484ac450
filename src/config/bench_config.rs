//! Bench configuration using Figment
//!
//! Strongly-typed configuration for one bench: application settings,
//! the instruments taking part (by role), synchronization and retry
//! policy, and the flat `[parameters]` mapping supplied by the operator.
//!
//! ```toml
//! [application]
//! name = "PSU bench"
//! log_level = "info"
//!
//! [[instruments]]
//! role = "psu"
//! driver = "modular"
//! address = "TCPIP::192.168.1.20::5025::SOCKET"
//! channel = 1
//!
//! [synchronization]
//! poll_interval = "20ms"
//! timeout = "30s"
//!
//! [parameters]
//! min_voltage = 0
//! max_voltage = "12.0"
//! ```

use crate::error::{BenchError, BenchResult};
use crate::instrument::registry::DriverRegistry;
use crate::instrument::Role;
use crate::retry::RetryPolicy;
use crate::sweep::synchronizer::PollPolicy;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::SweepConfiguration;

/// Top-level bench configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Instruments taking part in the run
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
    /// Status polling policy for synchronized measurements
    #[serde(default)]
    pub synchronization: SynchronizationConfig,
    /// Retry policy for a single sample acquisition
    #[serde(default)]
    pub retry: RetryConfig,
    /// Flat operator parameter mapping
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterValue>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name, recorded in report metadata
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for report output
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

/// One instrument bound to a bench role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Role the instrument plays in the sweep
    pub role: Role,
    /// Command-set name looked up in the [`DriverRegistry`]
    pub driver: String,
    /// Connection string (e.g. "TCPIP::10.0.0.5::5025::SOCKET")
    pub address: String,
    /// Output/input channel for multi-channel instruments
    #[serde(default)]
    pub channel: Option<u8>,
    /// I/O timeout in milliseconds
    #[serde(default = "default_io_timeout")]
    pub timeout_ms: u64,
}

impl InstrumentDefinition {
    /// I/O timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Status polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynchronizationConfig {
    /// Initial delay between status queries
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Multiplier applied to the interval after each unsuccessful poll
    #[serde(default = "default_backoff")]
    pub backoff: f64,
    /// Upper bound for the poll interval
    #[serde(with = "humantime_serde", default = "default_max_interval")]
    pub max_interval: Duration,
    /// Total time to wait for a completion code
    #[serde(with = "humantime_serde", default = "default_sync_timeout")]
    pub timeout: Duration,
}

impl Default for SynchronizationConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            backoff: default_backoff(),
            max_interval: default_max_interval(),
            timeout: default_sync_timeout(),
        }
    }
}

/// Sample acquisition retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per sample (1 = no retry)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between attempts
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub backoff_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_delay: default_retry_delay(),
        }
    }
}

/// A raw operator parameter.
///
/// Operators may write numbers, booleans or strings; everything is handed
/// to the sweep intake as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// `true` / `false`
    Bool(bool),
    /// Integer literal
    Integer(i64),
    /// Float literal
    Float(f64),
    /// Anything quoted
    Text(String),
}

impl ParameterValue {
    /// Text form passed to [`SweepConfiguration::from_params`].
    pub fn as_text(&self) -> String {
        match self {
            ParameterValue::Bool(b) => b.to_string(),
            ParameterValue::Integer(i) => i.to_string(),
            ParameterValue::Float(f) => f.to_string(),
            ParameterValue::Text(s) => s.clone(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("reports")
}

fn default_io_timeout() -> u64 {
    5000
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(20)
}

fn default_backoff() -> f64 {
    1.0
}

fn default_max_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_sync_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> u32 {
    1
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(100)
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl BenchConfig {
    /// Load configuration from `config/bench.toml` and environment variables
    pub fn load() -> BenchResult<Self> {
        Self::load_from("config/bench.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables with the `PSU_BENCH_` prefix override file
    /// values. After loading, configuration is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> BenchResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PSU_BENCH_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid
    /// - Exactly one PSU, at most one instrument per role
    /// - Driver names are registered, addresses non-empty
    /// - Synchronization and retry settings are usable
    pub fn validate(&self) -> BenchResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(BenchError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let registry = DriverRegistry::with_builtin();
        let mut roles = HashSet::new();
        for instrument in &self.instruments {
            if !roles.insert(instrument.role) {
                return Err(BenchError::Configuration(format!(
                    "Duplicate instrument role: '{}'",
                    instrument.role
                )));
            }
            if instrument.address.trim().is_empty() {
                return Err(BenchError::Configuration(format!(
                    "Instrument '{}': 'address' cannot be empty",
                    instrument.role
                )));
            }
            if !registry.contains(&instrument.driver) {
                return Err(BenchError::Configuration(format!(
                    "Instrument '{}': unknown driver '{}'. Must be one of: {}",
                    instrument.role,
                    instrument.driver,
                    registry.names().join(", ")
                )));
            }
        }
        if !roles.contains(&Role::Psu) {
            return Err(BenchError::Configuration(
                "A 'psu' instrument is required".to_string(),
            ));
        }

        let sync = &self.synchronization;
        if sync.poll_interval.is_zero() || sync.timeout.is_zero() {
            return Err(BenchError::Configuration(
                "synchronization poll_interval and timeout must be > 0".to_string(),
            ));
        }
        if !(sync.backoff.is_finite() && sync.backoff >= 1.0) {
            return Err(BenchError::Configuration(format!(
                "synchronization backoff {} must be finite and >= 1.0",
                sync.backoff
            )));
        }
        if sync.max_interval.is_zero() {
            return Err(BenchError::Configuration(
                "synchronization max_interval must be > 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(BenchError::Configuration(
                "retry max_attempts must be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the definition bound to a role
    pub fn instrument(&self, role: Role) -> Option<&InstrumentDefinition> {
        self.instruments.iter().find(|def| def.role == role)
    }

    /// Parameters as the flat text mapping expected by the sweep intake
    pub fn parameter_text(&self) -> HashMap<String, String> {
        self.parameters
            .iter()
            .map(|(key, value)| (key.clone(), value.as_text()))
            .collect()
    }

    /// Parse and validate the sweep parameters
    pub fn sweep_configuration(&self) -> BenchResult<SweepConfiguration> {
        SweepConfiguration::from_params(&self.parameter_text())
    }

    /// Status polling policy
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: self.synchronization.poll_interval,
            backoff: self.synchronization.backoff,
            max_interval: self.synchronization.max_interval,
            timeout: self.synchronization.timeout,
        }
    }

    /// Sample acquisition retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            backoff_delay: self.retry.backoff_delay,
        }
    }
}
