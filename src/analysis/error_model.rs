//! Programming and readback error against a linear error budget.
//!
//! For row `k`:
//!
//! - absolute error = measured - setpoint
//! - relative error % = absolute / setpoint * 100, `NaN` when the setpoint is 0
//! - readback error = readback - measured
//!
//! Each error is classified against `bound = gain * reference + offset * rated`:
//! the setpoint is the reference for programming error, the measured value
//! for readback error. Rows are independent; grouping by outer key is for
//! presentation only.

use crate::config::SweepConfiguration;
use crate::error::{BenchError, BenchResult};
use crate::sweep::{MeasurementSample, SweepOutput, SweepPoint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Gain/offset pair as written in a data sheet.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coefficients {
    /// Fraction of reading
    pub gain: f64,
    /// Fraction of rated full scale
    pub offset: f64,
}

/// Coefficients bound to a rated full-scale value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorBudget {
    /// Fraction of reading
    pub gain: f64,
    /// Fraction of rated full scale
    pub offset: f64,
    /// Rated full-scale value
    pub rated: f64,
}

impl ErrorBudget {
    /// Budget from data-sheet coefficients and a rating.
    pub fn new(coefficients: Coefficients, rated: f64) -> Self {
        Self {
            gain: coefficients.gain,
            offset: coefficients.offset,
            rated,
        }
    }

    /// Allowed deviation around `reference`.
    pub fn bound(&self, reference: f64) -> f64 {
        self.gain * reference + self.offset * self.rated
    }
}

/// Pass/fail outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    /// Within budget
    Pass,
    /// Outside budget, or not computable
    Fail,
}

impl Verdict {
    /// Whether this is a pass.
    pub fn passed(self) -> bool {
        self == Verdict::Pass
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
        })
    }
}

/// `Pass` iff `-bound <= error <= bound`. `NaN` anywhere fails.
pub fn classify(error: f64, reference: f64, budget: &ErrorBudget) -> Verdict {
    let bound = budget.bound(reference);
    if -bound <= error && error <= bound {
        Verdict::Pass
    } else {
        Verdict::Fail
    }
}

/// Which setpoint a row is compared on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    /// Voltage accuracy
    Voltage,
    /// Current accuracy
    Current,
}

impl Quantity {
    /// The setpoint of `point` for this quantity.
    pub fn setpoint(self, point: &SweepPoint) -> f64 {
        match self {
            Quantity::Voltage => point.voltage,
            Quantity::Current => point.current,
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Quantity::Voltage => "voltage",
            Quantity::Current => "current",
        })
    }
}

/// Derived errors for one row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Row index `k`
    pub index: usize,
    /// Outer-loop group key
    pub key: usize,
    /// Programmed value
    pub setpoint: f64,
    /// Reference measurement
    pub measured: f64,
    /// Supply-reported value
    pub readback: f64,
    /// measured - setpoint
    pub absolute_error: f64,
    /// absolute / setpoint * 100
    pub relative_error_pct: f64,
    /// readback - measured
    pub readback_error: f64,
    /// Programming error verdict
    pub programming: Verdict,
    /// Readback error verdict
    pub readback_verdict: Verdict,
}

/// Error computation for one quantity and its two budgets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorModel {
    /// Quantity under test
    pub quantity: Quantity,
    /// Programming error budget
    pub programming: ErrorBudget,
    /// Readback error budget
    pub readback: ErrorBudget,
}

impl ErrorModel {
    /// Model for `quantity` with the given budgets.
    pub fn new(quantity: Quantity, programming: ErrorBudget, readback: ErrorBudget) -> Self {
        Self {
            quantity,
            programming,
            readback,
        }
    }

    /// Budgets from a sweep configuration, rated against the full scale of
    /// `quantity`.
    pub fn from_config(config: &SweepConfiguration, quantity: Quantity) -> Self {
        let rated = match quantity {
            Quantity::Voltage => config.rated_voltage,
            Quantity::Current => config.rated_current,
        };
        Self::new(
            quantity,
            ErrorBudget::new(config.programming, rated),
            ErrorBudget::new(config.readback, rated),
        )
    }

    /// Derive one record per row of a sweep.
    pub fn evaluate(&self, output: &SweepOutput) -> BenchResult<Vec<ErrorRecord>> {
        self.compute_errors(&output.points, &output.measured, &output.readback)
    }

    /// Derive one record per row of three correlated sequences.
    ///
    /// The inputs are never modified; sequences of unequal length are
    /// rejected.
    pub fn compute_errors(
        &self,
        points: &[SweepPoint],
        measured: &[MeasurementSample],
        readback: &[MeasurementSample],
    ) -> BenchResult<Vec<ErrorRecord>> {
        if points.len() != measured.len() || points.len() != readback.len() {
            return Err(BenchError::Configuration(format!(
                "correlated sequences differ in length: {} points, {} measured, {} readback",
                points.len(),
                measured.len(),
                readback.len()
            )));
        }

        let records = points
            .iter()
            .zip(measured)
            .zip(readback)
            .enumerate()
            .map(|(index, ((point, measured), readback))| {
                self.record(index, point, measured.primary, readback.primary)
            })
            .collect();
        Ok(records)
    }

    fn record(
        &self,
        index: usize,
        point: &SweepPoint,
        measured: f64,
        readback: f64,
    ) -> ErrorRecord {
        let setpoint = self.quantity.setpoint(point);
        let absolute_error = measured - setpoint;
        let relative_error_pct = if setpoint == 0.0 {
            f64::NAN
        } else {
            absolute_error / setpoint * 100.0
        };
        let readback_error = readback - measured;

        ErrorRecord {
            index,
            key: point.key,
            setpoint,
            measured,
            readback,
            absolute_error,
            relative_error_pct,
            readback_error,
            programming: classify(absolute_error, setpoint, &self.programming),
            readback_verdict: classify(readback_error, measured, &self.readback),
        }
    }
}

/// Records grouped by outer key, in key order.
pub fn group_by_key(records: &[ErrorRecord]) -> BTreeMap<usize, Vec<&ErrorRecord>> {
    let mut groups: BTreeMap<usize, Vec<&ErrorRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.key).or_default().push(record);
    }
    groups
}

/// Pass/fail counts per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Summary {
    /// Rows counted
    pub rows: usize,
    /// Rows whose programming error passed
    pub programming_pass: usize,
    /// Rows whose readback error passed
    pub readback_pass: usize,
}

impl Summary {
    /// Count verdicts over `records`.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ErrorRecord>) -> Self {
        records.into_iter().fold(Self::default(), |mut acc, record| {
            acc.rows += 1;
            acc.programming_pass += usize::from(record.programming.passed());
            acc.readback_pass += usize::from(record.readback_verdict.passed());
            acc
        })
    }

    /// Rows whose programming error failed.
    pub fn programming_fail(&self) -> usize {
        self.rows - self.programming_pass
    }

    /// Rows whose readback error failed.
    pub fn readback_fail(&self) -> usize {
        self.rows - self.readback_pass
    }

    /// Whether every row passed on both channels.
    pub fn all_passed(&self) -> bool {
        self.programming_pass == self.rows && self.readback_pass == self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(gain: f64, offset: f64, rated: f64) -> ErrorBudget {
        ErrorBudget { gain, offset, rated }
    }

    fn point(voltage: f64, key: usize) -> SweepPoint {
        SweepPoint {
            voltage,
            current: 1.0,
            key,
        }
    }

    fn sample(primary: f64) -> MeasurementSample {
        MeasurementSample {
            primary,
            secondary: 0.0,
        }
    }

    #[test]
    fn bound_combines_gain_and_offset() {
        let b = budget(0.01, 0.001, 20.0);
        assert!((b.bound(10.0) - 0.12).abs() < 1e-12);
    }

    #[test]
    fn classification_against_budget() {
        let b = budget(0.01, 0.001, 20.0);
        assert_eq!(classify(10.05 - 10.0, 10.0, &b), Verdict::Pass);
        assert_eq!(classify(10.2 - 10.0, 10.0, &b), Verdict::Fail);
        assert_eq!(classify(-0.1, 10.0, &b), Verdict::Pass);
        assert_eq!(classify(f64::NAN, 10.0, &b), Verdict::Fail);
    }

    #[test]
    fn bound_edges_are_inclusive() {
        let b = budget(0.0, 0.5, 1.0);
        assert_eq!(classify(0.5, 3.0, &b), Verdict::Pass);
        assert_eq!(classify(-0.5, 3.0, &b), Verdict::Pass);
    }

    #[test]
    fn relative_error_undefined_at_zero_setpoint() {
        let model = ErrorModel::new(
            Quantity::Voltage,
            budget(0.01, 0.001, 20.0),
            budget(0.01, 0.001, 20.0),
        );
        let records = model
            .compute_errors(&[point(0.0, 0)], &[sample(0.002)], &[sample(0.001)])
            .unwrap();
        let record = records[0];
        assert!(record.relative_error_pct.is_nan());
        assert!((record.absolute_error - 0.002).abs() < 1e-12);
        assert!((record.readback_error + 0.001).abs() < 1e-12);
        assert_eq!(record.programming, Verdict::Pass);
    }

    #[test]
    fn readback_uses_measured_reference() {
        // gain-only budget: the bound scales with the reference
        let model = ErrorModel::new(
            Quantity::Voltage,
            budget(0.0, 0.0, 0.0),
            budget(0.01, 0.0, 0.0),
        );
        let records = model
            .compute_errors(&[point(1.0, 0)], &[sample(10.0)], &[sample(10.05)])
            .unwrap();
        // bound is 0.1 from measured=10, not 0.01 from setpoint=1
        assert_eq!(records[0].readback_verdict, Verdict::Pass);
        assert_eq!(records[0].programming, Verdict::Fail);
    }

    #[test]
    fn current_quantity_compares_current_setpoint() {
        let model = ErrorModel::new(
            Quantity::Current,
            budget(0.01, 0.0, 0.0),
            budget(0.01, 0.0, 0.0),
        );
        let records = model
            .compute_errors(&[point(12.0, 0)], &[sample(1.004)], &[sample(1.0)])
            .unwrap();
        assert_eq!(records[0].setpoint, 1.0);
        assert!((records[0].relative_error_pct - 0.4).abs() < 1e-9);
    }

    #[test]
    fn mismatched_lengths_rejected() {
        let model = ErrorModel::new(
            Quantity::Voltage,
            budget(0.0, 0.0, 0.0),
            budget(0.0, 0.0, 0.0),
        );
        assert!(model
            .compute_errors(&[point(1.0, 0)], &[], &[sample(1.0)])
            .is_err());
    }

    #[test]
    fn grouping_and_summary() {
        let model = ErrorModel::new(
            Quantity::Voltage,
            budget(0.01, 0.0, 0.0),
            budget(0.01, 0.0, 0.0),
        );
        let points = [point(1.0, 0), point(2.0, 0), point(1.0, 1)];
        let measured = [sample(1.0), sample(2.5), sample(1.0)];
        let readback = [sample(1.0), sample(2.5), sample(1.0)];
        let records = model.compute_errors(&points, &measured, &readback).unwrap();

        let groups = group_by_key(&records);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&0].len(), 2);
        assert_eq!(groups[&1][0].index, 2);

        let summary = Summary::from_records(&records);
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.programming_fail(), 1);
        assert_eq!(summary.readback_fail(), 0);
        assert!(!summary.all_passed());
    }
}
