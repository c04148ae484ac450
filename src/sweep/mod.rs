//! Measurement sweep orchestration.
//!
//! - [`variant`]: setpoint axes and the per-variant [`SweepPlan`](variant::SweepPlan)
//! - [`synchronizer`]: initiate/trigger/poll/fetch against a triggered DMM
//! - [`readback`]: measurement sources and secondary readback strategies
//! - [`controller`]: the nested sweep loop with interlock and ramp-down
//!
//! A sweep produces three positionally correlated sequences in a
//! [`SweepOutput`]: programmed points, measured samples and readback
//! samples. Index `k` is the only join key between them.

pub mod controller;
pub mod readback;
pub mod synchronizer;
pub mod variant;

use crate::config::BenchConfig;
use crate::error::{BenchError, BenchResult};
use crate::instrument::endpoint::ConnectionFactory;
use crate::instrument::registry::DriverRegistry;
use crate::instrument::{Instrument, Role};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// One programmed operating point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    /// Voltage setpoint (V)
    pub voltage: f64,
    /// Current setpoint (A)
    pub current: f64,
    /// Outer-loop iteration index, used to group rows
    pub key: usize,
}

impl SweepPoint {
    /// Power the point would draw.
    pub fn power(&self) -> f64 {
        self.voltage * self.current
    }
}

/// A (primary, secondary) reading pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    /// The value compared against the setpoint
    pub primary: f64,
    /// Companion value (flag, paired current, ...)
    pub secondary: f64,
}

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepOutput {
    /// Programmed points
    pub points: Vec<SweepPoint>,
    /// Reference measurements
    pub measured: Vec<MeasurementSample>,
    /// Supply-reported readbacks
    pub readback: Vec<MeasurementSample>,
}

impl SweepOutput {
    /// Append one fully acquired row.
    pub fn push(
        &mut self,
        point: SweepPoint,
        measured: MeasurementSample,
        readback: MeasurementSample,
    ) {
        self.points.push(point);
        self.measured.push(measured);
        self.readback.push(readback);
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether no row was recorded.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Cooperative cancellation flag, shared between the sweep and whoever may
/// stop it (e.g. a Ctrl-C handler).
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// A fresh, untriggered handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The sweep stops before its next point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Instrument sessions for one run.
///
/// The sweep borrows the bench mutably, so nothing else can talk to these
/// instruments while a sweep is running.
#[derive(Debug)]
pub struct Bench {
    psu: Instrument,
    eload: Option<Instrument>,
    dmm: Option<Instrument>,
}

impl Bench {
    /// Bench from already-open instruments.
    pub fn new(psu: Instrument, eload: Option<Instrument>, dmm: Option<Instrument>) -> Self {
        Self { psu, eload, dmm }
    }

    /// Resolve drivers and open every configured instrument.
    pub async fn assemble(
        config: &BenchConfig,
        registry: &DriverRegistry,
        factory: &dyn ConnectionFactory,
    ) -> BenchResult<Self> {
        let mut psu = None;
        let mut eload = None;
        let mut dmm = None;

        for definition in &config.instruments {
            let commands = registry.resolve(&definition.driver)?;
            let endpoint = factory
                .open(definition)
                .await
                .map_err(|err| BenchError::Connection {
                    instrument: definition.role.to_string(),
                    address: definition.address.clone(),
                    message: format!("{:#}", err),
                })?;
            info!(
                instrument = %definition.role,
                address = %definition.address,
                driver = commands.name(),
                "instrument opened"
            );
            let instrument =
                Instrument::new(definition.role, endpoint, commands, definition.channel);
            let slot = match definition.role {
                Role::Psu => &mut psu,
                Role::Eload => &mut eload,
                Role::Dmm => &mut dmm,
            };
            *slot = Some(instrument);
        }

        let psu = psu.ok_or_else(|| {
            BenchError::Configuration("no instrument with role 'psu' configured".to_string())
        })?;
        Ok(Self::new(psu, eload, dmm))
    }

    /// The supply.
    pub fn psu(&self) -> &Instrument {
        &self.psu
    }

    /// The electronic load, if present.
    pub fn eload(&self) -> Option<&Instrument> {
        self.eload.as_ref()
    }

    /// The DMM, if present.
    pub fn dmm(&self) -> Option<&Instrument> {
        self.dmm.as_ref()
    }

    /// Every present instrument, supply first.
    pub fn instruments(&self) -> impl Iterator<Item = &Instrument> {
        std::iter::once(&self.psu)
            .chain(self.eload.as_ref())
            .chain(self.dmm.as_ref())
    }
}
