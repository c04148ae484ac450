//! Measurement sources and secondary readback strategies.

use super::synchronizer::StatusCode;
use super::Bench;
use crate::error::{BenchError, BenchResult};
use crate::instrument::commands::MonitorKind;
use crate::instrument::Instrument;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where the primary (reference) measurement comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementSource {
    /// Triggered DMM acquisition, synchronized on its status register
    Dmm,
    /// The supply's vendor-specific raw monitor query
    PsuMonitor,
}

impl FromStr for MeasurementSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dmm" => Ok(MeasurementSource::Dmm),
            "monitor" | "psu_monitor" => Ok(MeasurementSource::PsuMonitor),
            other => Err(format!(
                "unknown measurement source '{}' (expected dmm or monitor)",
                other
            )),
        }
    }
}

/// Which value fills [`MeasurementSample::secondary`](super::MeasurementSample).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondaryKind {
    /// 1.0 when the DMM flagged overrange, else 0.0
    StatusFlag,
    /// Current measured by the electronic load
    LoadCurrent,
    /// Voltage measured by the electronic load
    LoadVoltage,
    /// Current from the supply's raw monitor record
    RawMonitor,
}

impl SecondaryKind {
    /// Snake-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SecondaryKind::StatusFlag => "status_flag",
            SecondaryKind::LoadCurrent => "load_current",
            SecondaryKind::LoadVoltage => "load_voltage",
            SecondaryKind::RawMonitor => "raw_monitor",
        }
    }

    /// Whether this readback queries the electronic load.
    pub fn needs_load(&self) -> bool {
        matches!(self, SecondaryKind::LoadCurrent | SecondaryKind::LoadVoltage)
    }

    /// Strategy implementing this readback.
    pub fn strategy(&self) -> Box<dyn SecondaryReadback> {
        match self {
            SecondaryKind::StatusFlag => Box::new(StatusFlag),
            SecondaryKind::LoadCurrent => Box::new(LoadMeasurement(MonitorKind::Current)),
            SecondaryKind::LoadVoltage => Box::new(LoadMeasurement(MonitorKind::Voltage)),
            SecondaryKind::RawMonitor => Box::new(RawMonitorCurrent),
        }
    }
}

impl fmt::Display for SecondaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecondaryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "status_flag" | "status" => Ok(SecondaryKind::StatusFlag),
            "load_current" => Ok(SecondaryKind::LoadCurrent),
            "load_voltage" => Ok(SecondaryKind::LoadVoltage),
            "raw_monitor" | "monitor" => Ok(SecondaryKind::RawMonitor),
            other => Err(format!("unknown secondary readback '{}'", other)),
        }
    }
}

/// Supplies the secondary value of a measured sample.
///
/// `status` is the completion word of the primary acquisition, when the
/// primary came from a synchronized DMM.
#[async_trait]
pub trait SecondaryReadback: Send + Sync {
    /// Read the secondary value for the current point.
    async fn read(&self, bench: &Bench, status: Option<StatusCode>) -> BenchResult<f64>;
}

struct StatusFlag;

#[async_trait]
impl SecondaryReadback for StatusFlag {
    async fn read(&self, _bench: &Bench, status: Option<StatusCode>) -> BenchResult<f64> {
        Ok(match status {
            Some(code) if code.is_overrange() => 1.0,
            _ => 0.0,
        })
    }
}

struct LoadMeasurement(MonitorKind);

#[async_trait]
impl SecondaryReadback for LoadMeasurement {
    async fn read(&self, bench: &Bench, _status: Option<StatusCode>) -> BenchResult<f64> {
        let load = bench.eload().ok_or_else(|| {
            BenchError::Configuration("secondary readback needs an electronic load".to_string())
        })?;
        measure(load, self.0).await
    }
}

struct RawMonitorCurrent;

#[async_trait]
impl SecondaryReadback for RawMonitorCurrent {
    async fn read(&self, bench: &Bench, _status: Option<StatusCode>) -> BenchResult<f64> {
        bench.psu().raw_monitor(MonitorKind::Current).await
    }
}

/// `MEAS:VOLT?` or `MEAS:CURR?` on one instrument.
pub async fn measure(instrument: &Instrument, kind: MonitorKind) -> BenchResult<f64> {
    match kind {
        MonitorKind::Voltage => instrument.measure_voltage().await,
        MonitorKind::Current => instrument.measure_current().await,
    }
}
