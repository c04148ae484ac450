//! Sweep variants and setpoint generation.
//!
//! All variants share one controller; a [`SweepPlan`] captures what differs
//! between them: which quantity each loop steps, whether the load takes
//! part, what the accuracy comparison is made on, and the default
//! secondary readback.

use super::readback::{MeasurementSource, SecondaryKind};
use super::{Bench, SweepPoint};
use crate::analysis::error_model::Quantity;
use crate::config::SweepConfiguration;
use crate::error::{BenchError, BenchResult};
use crate::instrument::commands::FunctionMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tolerance for float step-count rounding.
const STEP_EPSILON: f64 = 1e-9;

/// Evenly spaced setpoints from `min` to `max`.
///
/// Values are computed as `min + k * step`, never accumulated, and the last
/// one is clamped to `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisRange {
    min: f64,
    max: f64,
    step: f64,
    count: usize,
}

impl AxisRange {
    /// Axis over `[min, max]`. A non-positive or non-finite step yields a
    /// single point at `min`.
    pub fn new(min: f64, max: f64, step: f64) -> Self {
        let count = if step.is_finite() && step > 0.0 && max > min {
            let span = (max - min) / step;
            (span - STEP_EPSILON).max(0.0).ceil() as usize + 1
        } else {
            1
        };
        Self {
            min,
            max,
            step,
            count,
        }
    }

    /// Number of setpoints.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Always false; an axis holds at least `min`.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The `k`-th setpoint, clamped to `max`.
    pub fn value(&self, k: usize) -> f64 {
        let value = self.min + k as f64 * self.step;
        if value > self.max {
            self.max
        } else {
            value
        }
    }

    /// All setpoints in order.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.count).map(move |k| self.value(k))
    }
}

/// Which accuracy test a sweep performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepVariant {
    /// Outer PSU current limit, inner PSU voltage; no load connected.
    VoltageNoLoad,
    /// Outer PSU current, inner PSU voltage; load sinks a constant current.
    VoltageStaticLoad,
    /// Outer PSU voltage, inner load current.
    VoltageLoadSweep,
    /// Outer load-held voltage, inner PSU current (CC priority); the DMM
    /// reads a shunt.
    CurrentAccuracy,
}

impl SweepVariant {
    /// Every variant, in display order.
    pub const ALL: [SweepVariant; 4] = [
        SweepVariant::VoltageNoLoad,
        SweepVariant::VoltageStaticLoad,
        SweepVariant::VoltageLoadSweep,
        SweepVariant::CurrentAccuracy,
    ];

    /// Snake-case name used in config, CLI and report file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepVariant::VoltageNoLoad => "voltage_no_load",
            SweepVariant::VoltageStaticLoad => "voltage_static_load",
            SweepVariant::VoltageLoadSweep => "voltage_load_sweep",
            SweepVariant::CurrentAccuracy => "current_accuracy",
        }
    }
}

impl fmt::Display for SweepVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SweepVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase().replace('-', "_");
        SweepVariant::ALL
            .into_iter()
            .find(|variant| variant.as_str() == name)
            .ok_or_else(|| {
                let known: Vec<&str> = SweepVariant::ALL.iter().map(|v| v.as_str()).collect();
                format!(
                    "unknown sweep variant '{}' (expected one of {})",
                    s.trim(),
                    known.join(", ")
                )
            })
    }
}

/// Quantity stepped by one loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Volts
    Voltage,
    /// Amps
    Current,
}

/// Everything the controller needs to know about one variant, resolved
/// against a configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    /// The variant this plan was resolved from
    pub variant: SweepVariant,
    /// Quantity stepped by the outer loop
    pub outer_axis: Axis,
    /// Outer setpoints
    pub outer: AxisRange,
    /// Inner setpoints
    pub inner: AxisRange,
    /// PSU regulation priority
    pub psu_function: FunctionMode,
    /// Load operating mode, when the load takes part
    pub load_mode: Option<FunctionMode>,
    /// Quantity the accuracy comparison is made on
    pub quantity: Quantity,
    /// Where the primary measurement comes from
    pub source: MeasurementSource,
    /// Secondary readback
    pub secondary: SecondaryKind,
    /// Shunt for converting a DMM voltage into current
    pub shunt_resistance: Option<f64>,
}

impl SweepPlan {
    /// Resolve `variant` against `config`.
    pub fn resolve(variant: SweepVariant, config: &SweepConfiguration) -> BenchResult<Self> {
        let current = config.current_axis();
        let voltage = config.voltage_axis();
        let (outer_axis, outer, inner) = match variant {
            SweepVariant::VoltageNoLoad | SweepVariant::VoltageStaticLoad => {
                (Axis::Current, current, voltage)
            }
            SweepVariant::VoltageLoadSweep | SweepVariant::CurrentAccuracy => {
                (Axis::Voltage, voltage, current)
            }
        };
        let (psu_function, load_mode, quantity, default_secondary) = match variant {
            SweepVariant::VoltageNoLoad => (
                config.function_mode,
                None,
                Quantity::Voltage,
                SecondaryKind::StatusFlag,
            ),
            SweepVariant::VoltageStaticLoad | SweepVariant::VoltageLoadSweep => (
                config.function_mode,
                Some(FunctionMode::Current),
                Quantity::Voltage,
                SecondaryKind::LoadCurrent,
            ),
            SweepVariant::CurrentAccuracy => (
                FunctionMode::Current,
                Some(FunctionMode::Voltage),
                Quantity::Current,
                SecondaryKind::LoadVoltage,
            ),
        };

        let shunt_resistance = if quantity == Quantity::Current
            && config.measurement_source == MeasurementSource::Dmm
        {
            let shunt = config.shunt_resistance.ok_or_else(|| {
                BenchError::Configuration(format!(
                    "variant '{}' measures current through a shunt; set 'shunt_resistance'",
                    variant
                ))
            })?;
            Some(shunt)
        } else {
            None
        };

        let secondary = config.secondary_readback.unwrap_or(default_secondary);
        if load_mode.is_none() && secondary.needs_load() {
            return Err(BenchError::Configuration(format!(
                "secondary readback '{}' needs an electronic load, which variant '{}' does not use",
                secondary, variant
            )));
        }

        Ok(Self {
            variant,
            outer_axis,
            outer,
            inner,
            psu_function,
            load_mode,
            quantity,
            source: config.measurement_source,
            secondary,
            shunt_resistance,
        })
    }

    /// Whether the electronic load takes part.
    pub fn uses_load(&self) -> bool {
        self.load_mode.is_some()
    }

    /// Whether the DMM takes part.
    pub fn uses_dmm(&self) -> bool {
        self.source == MeasurementSource::Dmm
    }

    /// Fail before any I/O if an instrument this plan needs is missing.
    pub fn check_bench(&self, bench: &Bench) -> BenchResult<()> {
        if self.uses_load() && bench.eload().is_none() {
            return Err(BenchError::Configuration(format!(
                "variant '{}' needs an electronic load; add an instrument with role 'eload'",
                self.variant
            )));
        }
        if self.uses_dmm() && bench.dmm().is_none() {
            return Err(BenchError::Configuration(
                "measurement source 'dmm' needs an instrument with role 'dmm'; or use 'monitor'"
                    .to_string(),
            ));
        }
        let needs_monitor = self.source == MeasurementSource::PsuMonitor
            || self.secondary == SecondaryKind::RawMonitor;
        if needs_monitor && !bench.psu().has_raw_monitor() {
            return Err(BenchError::Configuration(format!(
                "driver '{}' on the psu has no raw monitor query; use measurement source 'dmm' \
                 and a different secondary readback",
                bench.psu().driver()
            )));
        }
        Ok(())
    }

    /// Outer setpoint `i` after the operating-point rules.
    pub fn outer_value(&self, i: usize, config: &SweepConfiguration) -> f64 {
        let value = self.outer.value(i);
        match self.outer_axis {
            Axis::Current => outer_current(value, config),
            Axis::Voltage => value,
        }
    }

    /// Inner setpoint `j` after the operating-point rules.
    pub fn inner_value(&self, j: usize, config: &SweepConfiguration) -> f64 {
        let value = self.inner.value(j);
        match (self.outer_axis, self.variant) {
            (Axis::Current, _) => value,
            // the load sinks the inner current, so it never sits at zero
            (Axis::Voltage, SweepVariant::VoltageLoadSweep) => outer_current(value, config),
            (Axis::Voltage, _) => value.min(config.max_current),
        }
    }

    /// Candidate point for outer `(i, outer)` and inner `inner`.
    pub fn point(&self, key: usize, outer: f64, inner: f64) -> SweepPoint {
        match self.outer_axis {
            Axis::Current => SweepPoint {
                voltage: inner,
                current: outer,
                key,
            },
            Axis::Voltage => SweepPoint {
                voltage: outer,
                current: inner,
                key,
            },
        }
    }
}

/// Clamp to `max_current`, then lift an exact zero by `offset_current`.
pub fn outer_current(value: f64, config: &SweepConfiguration) -> f64 {
    let clamped = value.min(config.max_current);
    if clamped == 0.0 {
        clamped + config.offset_current
    } else {
        clamped
    }
}

/// Current to program into the load when it sinks `current`.
///
/// At or above the supply's own ceiling the load is backed off by
/// `load_backoff` so source and sink never enforce the same limit at once.
pub fn load_setpoint(current: f64, config: &SweepConfiguration) -> f64 {
    match config.psu_max_current {
        Some(ceiling) if current >= ceiling - STEP_EPSILON => {
            (current - config.load_backoff).max(0.0)
        }
        _ => current,
    }
}
