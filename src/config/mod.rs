//! Bench configuration.
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `PSU_BENCH_`
//! 2. TOML configuration file (default: `config/bench.toml`)
//!
//! The `[parameters]` table is the flat operator mapping consumed by
//! [`SweepConfiguration::from_params`]. Nested keys in environment variables
//! are separated by a double underscore:
//!
//! ```text
//! PSU_BENCH_APPLICATION__LOG_LEVEL=debug
//! PSU_BENCH_PARAMETERS__MAX_VOLTAGE=12
//! ```
//!
//! # Example
//!
//! ```no_run
//! use psu_bench::config::BenchConfig;
//!
//! # fn main() -> Result<(), psu_bench::error::BenchError> {
//! let config = BenchConfig::load_from("config/bench.toml")?;
//! let sweep = config.sweep_configuration()?;
//! println!("{} current points", sweep.current_axis().len());
//! # Ok(())
//! # }
//! ```

pub mod bench_config;
pub mod sweep_config;

pub use bench_config::{
    ApplicationConfig, BenchConfig, InstrumentDefinition, ParameterValue, RetryConfig,
    SynchronizationConfig,
};
pub use sweep_config::SweepConfiguration;
