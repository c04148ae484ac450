//! Core library for the psu_bench application.
//!
//! Automates accuracy testing of programmable power supplies on a bench with
//! an electronic load and a reference DMM: the supply is stepped through a
//! grid of voltage/current setpoints, every point is measured independently
//! and read back from the supply, and the differences are classified
//! against a gain + offset error budget.
//!
//! The library is used by the `psu_bench` binary; it never installs a log
//! subscriber itself.

pub mod analysis;
pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod report;
pub mod retry;
pub mod sweep;

pub use error::{BenchError, BenchResult};
