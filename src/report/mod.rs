//! Flat output records for the reporting side.
//!
//! [`write_csv`] stores one row per [`ErrorRecord`], preceded by the run
//! metadata as `# `-prefixed JSON lines. [`summary`] gives per-group
//! pass/fail counts for the console.

use crate::analysis::error_model::{group_by_key, ErrorRecord, Quantity, Summary};
use crate::sweep::variant::{Axis, SweepVariant};
use crate::sweep::SweepPoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Run-level metadata written at the top of a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Unique run id
    pub run_id: Uuid,
    /// Application name from the configuration
    pub application: String,
    /// Sweep variant
    pub variant: SweepVariant,
    /// Quantity under test
    pub quantity: Quantity,
    /// Start time
    pub started: DateTime<Utc>,
    /// Operator parameters as supplied
    pub parameters: BTreeMap<String, String>,
}

impl RunMetadata {
    /// Metadata for a run starting now.
    pub fn new(
        application: impl Into<String>,
        variant: SweepVariant,
        quantity: Quantity,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            application: application.into(),
            variant,
            quantity,
            started: Utc::now(),
            parameters,
        }
    }

    /// `sweep_<variant>_<timestamp>.csv`
    pub fn file_name(&self) -> String {
        format!(
            "sweep_{}_{}.csv",
            self.variant,
            self.started.format("%Y%m%d_%H%M%S")
        )
    }
}

/// Pass/fail counts for one outer group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    /// Outer-loop key
    pub key: usize,
    /// Outer setpoint shared by the group
    pub outer_setpoint: f64,
    /// Counts for the group
    pub counts: Summary,
}

/// Per-group pass/fail counts, in key order.
///
/// `points` supplies the outer setpoint of each group; it must be the
/// sequence the records were computed from.
pub fn summary(
    records: &[ErrorRecord],
    points: &[SweepPoint],
    outer_axis: Axis,
) -> Vec<GroupSummary> {
    group_by_key(records)
        .into_iter()
        .map(|(key, rows)| {
            let outer_setpoint = rows
                .first()
                .and_then(|row| points.get(row.index))
                .map(|point| match outer_axis {
                    Axis::Current => point.current,
                    Axis::Voltage => point.voltage,
                })
                .unwrap_or(f64::NAN);
            GroupSummary {
                key,
                outer_setpoint,
                counts: Summary::from_records(rows),
            }
        })
        .collect()
}

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::RunMetadata;
    use crate::analysis::error_model::ErrorRecord;
    use crate::error::{BenchError, BenchResult};
    use std::fs::File;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use tracing::info;

    const HEADER: [&str; 10] = [
        "index",
        "key",
        "setpoint",
        "measured",
        "readback",
        "absolute_error",
        "relative_error_pct",
        "readback_error",
        "programming",
        "readback_verdict",
    ];

    /// Write `records` under `dir`, creating it if needed. Returns the path.
    pub fn write_csv(
        dir: &Path,
        metadata: &RunMetadata,
        records: &[ErrorRecord],
    ) -> BenchResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(metadata.file_name());
        let mut file = File::create(&path)?;

        let json = serde_json::to_string_pretty(metadata).map_err(|err| {
            BenchError::Configuration(format!("metadata not serializable: {}", err))
        })?;
        for line in json.lines() {
            writeln!(file, "# {}", line)?;
        }

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(HEADER).map_err(csv_error)?;
        for record in records {
            writer
                .write_record(&[
                    record.index.to_string(),
                    record.key.to_string(),
                    record.setpoint.to_string(),
                    record.measured.to_string(),
                    record.readback.to_string(),
                    record.absolute_error.to_string(),
                    record.relative_error_pct.to_string(),
                    record.readback_error.to_string(),
                    record.programming.to_string(),
                    record.readback_verdict.to_string(),
                ])
                .map_err(csv_error)?;
        }
        writer.flush()?;

        info!(path = %path.display(), rows = records.len(), "report written");
        Ok(path)
    }

    fn csv_error(err: csv::Error) -> BenchError {
        BenchError::Io(std::io::Error::other(err))
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::write_csv;

/// Stub when CSV output is compiled out.
#[cfg(not(feature = "storage_csv"))]
pub fn write_csv(
    _dir: &std::path::Path,
    _metadata: &RunMetadata,
    _records: &[ErrorRecord],
) -> crate::error::BenchResult<std::path::PathBuf> {
    Err(crate::error::BenchError::Configuration(
        "CSV support not enabled. Rebuild with --features storage_csv".to_string(),
    ))
}
