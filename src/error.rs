//! Custom error types for the bench harness.
//!
//! `BenchError` is the single domain error for configuration intake, the
//! instrument facade, the status synchronizer and the sweep controller.
//! Transports work in `anyhow` and are converted here with the instrument
//! name and command attached, so a failure always says *which* instrument
//! and *which* command broke.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: figment could not load or deserialize the configuration.
//! - **`Configuration`**: semantically invalid sweep parameters (zero step,
//!   inverted bounds, missing or non-numeric keys). Raised before any
//!   instrument I/O.
//! - **`Connection`** / **`Instrument`** / **`Parse`**: communication
//!   failures on a named instrument.
//! - **`SynchronizationTimeout`**: the status poll budget ran out.
//! - **`Sweep`**: wraps a failure with the sweep index where it happened.
//! - **`TeardownFailed`**: one or more ramp-down steps failed.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the bench error type.
pub type BenchResult<T> = std::result::Result<T, BenchError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum BenchError {
    #[error("Configuration load error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Failed to open '{instrument}' at '{address}': {message}")]
    Connection {
        instrument: String,
        address: String,
        message: String,
    },

    #[error("Instrument '{instrument}' failed on '{command}': {message}")]
    Instrument {
        instrument: String,
        command: String,
        message: String,
    },

    #[error("Instrument '{instrument}' returned unparseable reply to '{command}': {response:?}")]
    Parse {
        instrument: String,
        command: String,
        response: String,
    },

    #[error("Instrument '{instrument}' not complete after {waited:?} (status: {last_status:?})")]
    SynchronizationTimeout {
        instrument: String,
        waited: Duration,
        last_status: Option<u32>,
    },

    #[error("Sweep cancelled before point {index}")]
    Cancelled { index: usize },

    #[error("Sweep failed at point {index}: {source}")]
    Sweep {
        index: usize,
        #[source]
        source: Box<BenchError>,
    },

    #[error("Ramp-down failed with {} error(s)", .0.len())]
    TeardownFailed(Vec<BenchError>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for BenchError {
    fn from(err: figment::Error) -> Self {
        BenchError::Config(Box::new(err))
    }
}

impl BenchError {
    /// Wraps this error with the sweep index it occurred at.
    ///
    /// Errors that already carry an index are returned unchanged.
    pub fn at_index(self, index: usize) -> Self {
        match self {
            err @ (BenchError::Sweep { .. } | BenchError::Cancelled { .. }) => err,
            other => BenchError::Sweep {
                index,
                source: Box::new(other),
            },
        }
    }

    /// Sweep index attached to this error, if any.
    pub fn index(&self) -> Option<usize> {
        match self {
            BenchError::Sweep { index, .. } | BenchError::Cancelled { index } => Some(*index),
            _ => None,
        }
    }
}
