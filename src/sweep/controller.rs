//! The sweep engine.
//!
//! One controller runs every [`SweepVariant`]: set up the bench, walk the
//! outer and inner axes, program each point, settle, read back, measure,
//! and record. The power interlock and cancellation can end the walk early.
//! Ramp-down runs on every exit path.
//!
//! # Ordering
//!
//! Instrument calls are awaited one at a time in program order. Within a
//! point: program setpoint(s), `*WAI`, settle, supply readback, primary
//! measurement, secondary readback, record. A row is pushed only once all
//! three parts exist, so the output sequences never lose alignment.
//!
//! # Interlock
//!
//! The candidate point is checked before it is programmed. A point with
//! `V * I > power`, or a product that is not finite, is never applied and
//! ends the inner loop for that outer setpoint. This is logged, not an error.

use super::readback::{measure, MeasurementSource, SecondaryReadback};
use super::synchronizer::{PollPolicy, StatusCode, StatusSynchronizer};
use super::variant::{load_setpoint, Axis, SweepPlan, SweepVariant};
use super::{Bench, CancelHandle, MeasurementSample, SweepOutput, SweepPoint};
use crate::analysis::error_model::Quantity;
use crate::config::SweepConfiguration;
use crate::error::{BenchError, BenchResult};
use crate::instrument::commands::{FunctionMode, MonitorKind, Pairing};
use crate::instrument::Instrument;
use crate::retry::RetryPolicy;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Runs sweeps against a [`Bench`].
///
/// Holds no per-run data; every call to [`run_sweep`](Self::run_sweep)
/// returns fresh sequences.
#[derive(Debug, Clone)]
pub struct SweepController {
    synchronizer: StatusSynchronizer,
    retry: RetryPolicy,
}

impl Default for SweepController {
    fn default() -> Self {
        Self::new(PollPolicy::default(), RetryPolicy::default())
    }
}

impl SweepController {
    /// Controller with the given poll and retry policies.
    pub fn new(poll: PollPolicy, retry: RetryPolicy) -> Self {
        Self {
            synchronizer: StatusSynchronizer::new(poll),
            retry,
        }
    }

    /// Run one sweep.
    ///
    /// Configuration problems are reported before any instrument I/O. Once
    /// I/O has started, ramp-down is always attempted. If both the sweep and
    /// the ramp-down fail, the sweep error is returned and the ramp-down
    /// error is logged.
    pub async fn run_sweep(
        &mut self,
        bench: &mut Bench,
        config: &SweepConfiguration,
        variant: SweepVariant,
        cancel: &CancelHandle,
    ) -> BenchResult<SweepOutput> {
        config.validate()?;
        let plan = SweepPlan::resolve(variant, config)?;
        plan.check_bench(bench)?;

        info!(
            variant = %variant,
            outer_points = plan.outer.len(),
            inner_points = plan.inner.len(),
            "starting sweep"
        );

        let body = self.sweep(bench, config, &plan, cancel).await;
        let teardown = ramp_down(bench, config).await;

        match (body, teardown) {
            (Ok(output), Ok(())) => {
                info!(variant = %variant, rows = output.len(), "sweep complete");
                Ok(output)
            }
            (Ok(_), Err(teardown)) => {
                error!(error = %teardown, "ramp-down failed after a completed sweep");
                Err(teardown)
            }
            (Err(err), Ok(())) => {
                error!(error = %err, "sweep aborted");
                Err(err)
            }
            (Err(err), Err(teardown)) => {
                error!(error = %err, "sweep aborted");
                error!(error = %teardown, "ramp-down failed after sweep error");
                Err(err)
            }
        }
    }

    async fn sweep(
        &mut self,
        bench: &Bench,
        config: &SweepConfiguration,
        plan: &SweepPlan,
        cancel: &CancelHandle,
    ) -> BenchResult<SweepOutput> {
        setup(bench, config, plan).await?;

        let secondary = plan.secondary.strategy();
        let mut output = SweepOutput::default();
        let mut k = 0usize;

        for i in 0..plan.outer.len() {
            let outer = plan.outer_value(i, config);
            info!(key = i, outer, axis = ?plan.outer_axis, "outer setpoint");
            let mut outer_applied = false;

            for j in 0..plan.inner.len() {
                if cancel.is_cancelled() {
                    warn!(k, "sweep cancelled");
                    return Err(BenchError::Cancelled { index: k });
                }

                let inner = plan.inner_value(j, config);
                let point = plan.point(i, outer, inner);
                let power = point.power();
                if exceeds_power(power, config.power) {
                    warn!(
                        k,
                        voltage = point.voltage,
                        current = point.current,
                        power,
                        limit = config.power,
                        "power interlock: ending inner loop"
                    );
                    break;
                }

                self.apply(bench, config, plan, &point, !outer_applied)
                    .await
                    .map_err(|err| err.at_index(k))?;
                outer_applied = true;

                let settle = config.total_settle();
                if !settle.is_zero() {
                    sleep(settle).await;
                }

                let (measured, readback) = self
                    .acquire(bench, plan, secondary.as_ref())
                    .await
                    .map_err(|err| err.at_index(k))?;
                debug!(
                    k,
                    voltage = point.voltage,
                    current = point.current,
                    measured = measured.primary,
                    readback = readback.primary,
                    "point recorded"
                );
                output.push(point, measured, readback);
                k += 1;
            }
        }

        Ok(output)
    }

    /// Program one point. The inner setpoint goes first, so a new outer
    /// setpoint is never combined with the previous group's inner one.
    async fn apply(
        &self,
        bench: &Bench,
        config: &SweepConfiguration,
        plan: &SweepPlan,
        point: &SweepPoint,
        with_outer: bool,
    ) -> BenchResult<()> {
        let psu = bench.psu();
        let load = bench.eload();

        match plan.variant {
            SweepVariant::VoltageNoLoad | SweepVariant::VoltageStaticLoad => {
                psu.set_voltage(point.voltage).await?;
                if with_outer {
                    psu.set_current(point.current).await?;
                    if let Some(load) = load {
                        let sink = config.static_load_current.unwrap_or(point.current);
                        load.set_current(load_setpoint(sink, config)).await?;
                    }
                }
            }
            SweepVariant::VoltageLoadSweep => {
                if let Some(load) = load {
                    load.set_current(load_setpoint(point.current, config)).await?;
                }
                if with_outer {
                    psu.set_voltage(point.voltage).await?;
                }
            }
            SweepVariant::CurrentAccuracy => {
                psu.set_current(point.current).await?;
                if with_outer {
                    if let Some(load) = load {
                        load.set_voltage(point.voltage).await?;
                    }
                }
            }
        }

        psu.wait().await?;
        if let Some(load) = load {
            load.wait().await?;
        }
        Ok(())
    }

    /// Readback and measurement for the current point, retried per policy.
    async fn acquire(
        &mut self,
        bench: &Bench,
        plan: &SweepPlan,
        secondary: &dyn SecondaryReadback,
    ) -> BenchResult<(MeasurementSample, MeasurementSample)> {
        let mut attempt = 1;
        loop {
            match self.acquire_once(bench, plan, secondary).await {
                Ok(samples) => return Ok(samples),
                Err(err) => {
                    if !self.retry.retry_after(attempt, &err).await {
                        return Err(err);
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn acquire_once(
        &mut self,
        bench: &Bench,
        plan: &SweepPlan,
        secondary: &dyn SecondaryReadback,
    ) -> BenchResult<(MeasurementSample, MeasurementSample)> {
        let psu = bench.psu();
        let (primary_kind, other_kind) = match plan.quantity {
            Quantity::Voltage => (MonitorKind::Voltage, MonitorKind::Current),
            Quantity::Current => (MonitorKind::Current, MonitorKind::Voltage),
        };
        let readback = MeasurementSample {
            primary: measure(psu, primary_kind).await?,
            secondary: measure(psu, other_kind).await?,
        };

        let (primary, status) = self.primary(bench, plan, primary_kind).await?;
        let measured = MeasurementSample {
            primary,
            secondary: secondary.read(bench, status).await?,
        };
        Ok((measured, readback))
    }

    async fn primary(
        &mut self,
        bench: &Bench,
        plan: &SweepPlan,
        kind: MonitorKind,
    ) -> BenchResult<(f64, Option<StatusCode>)> {
        match plan.source {
            MeasurementSource::Dmm => {
                let dmm = required(bench.dmm(), "dmm")?;
                let fetched = self.synchronizer.acquire(dmm).await?;
                let value = match plan.shunt_resistance {
                    Some(ohms) => fetched.value / ohms,
                    None => fetched.value,
                };
                Ok((value, Some(fetched.status)))
            }
            MeasurementSource::PsuMonitor => {
                let value = bench.psu().raw_monitor(kind).await?;
                Ok((value, None))
            }
        }
    }
}

/// Interlock predicate. A power that is not a finite number always trips.
fn exceeds_power(power: f64, limit: f64) -> bool {
    !power.is_finite() || power > limit
}

fn required<'a>(instrument: Option<&'a Instrument>, role: &str) -> BenchResult<&'a Instrument> {
    instrument.ok_or_else(|| {
        BenchError::Configuration(format!("no instrument with role '{}' on the bench", role))
    })
}

/// Reset, clear and configure every participating instrument, then enable
/// outputs at a safe baseline.
async fn setup(bench: &Bench, config: &SweepConfiguration, plan: &SweepPlan) -> BenchResult<()> {
    info!(variant = %plan.variant, "configuring instruments");
    for instrument in bench.instruments() {
        instrument.reset().await?;
        instrument.clear_errors().await?;
    }

    if let Some(dmm) = bench.dmm() {
        dmm.configure_dmm(&config.dmm).await?;
    }

    let psu = bench.psu();
    psu.set_function(plan.psu_function).await?;
    psu.set_sense(config.sense).await?;
    psu.set_pairing(config.pairing).await?;

    match plan.outer_axis {
        Axis::Current => psu.set_voltage(0.0).await?,
        Axis::Voltage if plan.psu_function == FunctionMode::Current => {
            // CC priority: the voltage setting is only the compliance limit
            psu.set_voltage(config.max_voltage).await?;
            psu.set_current(0.0).await?;
        }
        Axis::Voltage => {
            psu.set_voltage(0.0).await?;
            psu.set_current(config.psu_max_current.unwrap_or(config.max_current))
                .await?;
        }
    }

    if let (Some(load), Some(mode)) = (bench.eload(), plan.load_mode) {
        load.set_load_mode(mode).await?;
        if mode == FunctionMode::Voltage {
            load.set_voltage(config.min_voltage).await?;
        }
    }

    psu.set_output(true).await?;
    if plan.uses_load() {
        if let Some(load) = bench.eload() {
            load.set_input(true).await?;
        }
    }
    psu.wait().await?;
    Ok(())
}

/// Drive the bench to a safe state.
///
/// Every step is attempted even when an earlier one fails; failures are
/// collected into [`BenchError::TeardownFailed`].
pub async fn ramp_down(bench: &Bench, config: &SweepConfiguration) -> BenchResult<()> {
    info!("ramping down");
    let psu = bench.psu();
    let mut failures = Vec::new();

    step(&mut failures, "psu voltage 0", psu.set_voltage(0.0).await);
    step(
        &mut failures,
        "psu current minimum",
        psu.set_current(config.min_current).await,
    );
    if let Some(load) = bench.eload() {
        step(&mut failures, "load input off", load.set_input(false).await);
        step(&mut failures, "load current 0", load.set_current(0.0).await);
    }
    step(&mut failures, "pairing off", psu.set_pairing(Pairing::Off).await);
    step(&mut failures, "psu output off", psu.set_output(false).await);
    if let Some(dmm) = bench.dmm() {
        step(&mut failures, "dmm reset", dmm.reset().await);
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(BenchError::TeardownFailed(failures))
    }
}

fn step(failures: &mut Vec<BenchError>, name: &str, result: BenchResult<()>) {
    if let Err(err) = result {
        warn!(step = name, error = %err, "ramp-down step failed");
        failures.push(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::commands::{GenericScpi, LoadScpi};
    use crate::instrument::mock::{SimulatedBehaviour, SimulatedBench};
    use crate::instrument::Role;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn instrument(sim: &SimulatedBench, role: Role) -> Instrument {
        let commands: Arc<dyn crate::instrument::commands::CommandSet> = match role {
            Role::Eload => Arc::new(LoadScpi),
            _ => Arc::new(GenericScpi),
        };
        Instrument::new(role, Arc::new(sim.endpoint(role)), commands, None)
    }

    fn bench(sim: &SimulatedBench, with_load: bool) -> Bench {
        Bench::new(
            instrument(sim, Role::Psu),
            with_load.then(|| instrument(sim, Role::Eload)),
            Some(instrument(sim, Role::Dmm)),
        )
    }

    fn config(pairs: &[(&str, &str)]) -> SweepConfiguration {
        let mut params: HashMap<String, String> = [
            ("min_current", "1"),
            ("max_current", "2"),
            ("current_step", "1"),
            ("min_voltage", "0"),
            ("max_voltage", "1"),
            ("voltage_step", "1"),
            ("power", "100"),
            ("settle_delay", "0.01"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in pairs {
            params.insert(k.to_string(), v.to_string());
        }
        SweepConfiguration::from_params(&params).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn static_load_sinks_outer_current() {
        let sim = SimulatedBench::new();
        let mut bench = bench(&sim, true);
        let config = config(&[("psu_max_current", "2")]);
        let output = SweepController::default()
            .run_sweep(&mut bench, &config, SweepVariant::VoltageStaticLoad, &CancelHandle::new())
            .await
            .unwrap();

        assert_eq!(output.len(), 4);
        let load = sim.commands(Role::Eload);
        assert!(load.contains(&"CURR 1".to_string()));
        // at the supply ceiling the load backs off
        assert!(load.contains(&"CURR 1.9".to_string()));
        assert!(load.contains(&"FUNC CURR".to_string()));
        assert_eq!(output.measured[3].secondary, 1.9);
    }

    #[tokio::test(start_paused = true)]
    async fn load_sweep_steps_load_current() {
        let sim = SimulatedBench::new();
        let mut bench = bench(&sim, true);
        let config = config(&[("min_voltage", "5"), ("max_voltage", "5")]);
        let output = SweepController::default()
            .run_sweep(&mut bench, &config, SweepVariant::VoltageLoadSweep, &CancelHandle::new())
            .await
            .unwrap();

        let pairs: Vec<(f64, f64)> = output.points.iter().map(|p| (p.voltage, p.current)).collect();
        assert_eq!(pairs, vec![(5.0, 1.0), (5.0, 2.0)]);
        assert_eq!(output.measured[1].primary, 5.0);
        assert_eq!(output.measured[1].secondary, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn current_accuracy_scales_shunt_voltage() {
        let sim = SimulatedBench::with_behaviour(SimulatedBehaviour {
            shunt_resistance: Some(0.01),
            ..Default::default()
        });
        let mut bench = bench(&sim, true);
        let config = config(&[
            ("min_voltage", "3"),
            ("max_voltage", "3"),
            ("shunt_resistance", "0.01"),
        ]);
        let output = SweepController::default()
            .run_sweep(&mut bench, &config, SweepVariant::CurrentAccuracy, &CancelHandle::new())
            .await
            .unwrap();

        assert_eq!(output.len(), 2);
        for (point, measured) in output.points.iter().zip(&output.measured) {
            assert!((measured.primary - point.current).abs() < 1e-6);
            assert_eq!(measured.secondary, 3.0);
        }
        assert!(sim.commands(Role::Psu).contains(&"FUNC CURR".to_string()));
        assert!(sim.commands(Role::Eload).contains(&"FUNC VOLT".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_source_skips_dmm() {
        let sim = SimulatedBench::with_behaviour(SimulatedBehaviour {
            readback_offset: 0.002,
            ..Default::default()
        });
        let psu = Instrument::new(
            Role::Psu,
            Arc::new(sim.endpoint(Role::Psu)),
            Arc::new(crate::instrument::commands::ModularScpi),
            Some(1),
        );
        let mut bench = Bench::new(psu, None, None);
        let config = config(&[("measurement_source", "monitor")]);
        let output = SweepController::default()
            .run_sweep(&mut bench, &config, SweepVariant::VoltageNoLoad, &CancelHandle::new())
            .await
            .unwrap();

        assert_eq!(output.len(), 4);
        assert!((output.measured[1].primary - 1.002).abs() < 1e-9);
        assert!(sim.commands(Role::Dmm).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_load_is_configuration_error_without_io() {
        let sim = SimulatedBench::new();
        let mut bench = bench(&sim, false);
        let err = SweepController::default()
            .run_sweep(
                &mut bench,
                &config(&[]),
                SweepVariant::VoltageLoadSweep,
                &CancelHandle::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
        assert!(sim.log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_needs_a_driver_with_raw_monitor() {
        let sim = SimulatedBench::new();
        let mut bench = bench(&sim, true);
        for pairs in [
            [("measurement_source", "monitor")],
            [("secondary_readback", "raw_monitor")],
        ] {
            let err = SweepController::default()
                .run_sweep(
                    &mut bench,
                    &config(&pairs),
                    SweepVariant::VoltageNoLoad,
                    &CancelHandle::new(),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, BenchError::Configuration(_)), "{pairs:?}");
            assert!(err.to_string().contains("'generic'"), "{err}");
        }
        assert!(sim.log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_a_transient_fetch() {
        let sim = SimulatedBench::new();
        let mut bench = bench(&sim, false);
        sim.fail_once(Role::Dmm, "FETC?");
        let mut controller = SweepController::new(
            PollPolicy::default(),
            RetryPolicy {
                max_attempts: 2,
                backoff_delay: Duration::from_millis(5),
            },
        );
        let output = controller
            .run_sweep(&mut bench, &config(&[]), SweepVariant::VoltageNoLoad, &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(output.len(), 4);
    }

    #[test]
    fn non_finite_power_trips_interlock() {
        assert!(exceeds_power(f64::NAN, 10.0));
        assert!(exceeds_power(f64::INFINITY, 10.0));
        assert!(exceeds_power(10.5, 10.0));
        assert!(!exceeds_power(10.0, 10.0));
        assert!(!exceeds_power(0.0, 10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_offset_current_is_rejected_before_io() {
        let sim = SimulatedBench::new();
        let mut bench = bench(&sim, false);
        let mut config = config(&[("min_current", "0"), ("power", "10")]);
        config.offset_current = f64::NAN;
        let err = SweepController::default()
            .run_sweep(&mut bench, &config, SweepVariant::VoltageNoLoad, &CancelHandle::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
        assert!(sim.log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn interlock_is_logged_not_raised() {
        let sim = SimulatedBench::new();
        let mut bench = bench(&sim, false);
        let config = config(&[
            ("power", "10"),
            ("max_voltage", "20"),
            ("voltage_step", "5"),
            ("max_current", "1"),
        ]);
        let output = SweepController::default()
            .run_sweep(&mut bench, &config, SweepVariant::VoltageNoLoad, &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(output.len(), 3);
        assert!(logs_contain("power interlock"));
    }

    #[tokio::test(start_paused = true)]
    async fn settle_delay_is_applied_per_point() {
        let sim = SimulatedBench::new();
        let mut bench = bench(&sim, false);
        let config = config(&[("settle_delay", "0.5"), ("update_delay", "0.25")]);
        let started = tokio::time::Instant::now();
        SweepController::default()
            .run_sweep(&mut bench, &config, SweepVariant::VoltageNoLoad, &CancelHandle::new())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(4 * 750));
    }
}
