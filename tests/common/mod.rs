//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use psu_bench::config::SweepConfiguration;
use psu_bench::instrument::commands::{CommandSet, GenericScpi, LoadScpi, ModularScpi};
use psu_bench::instrument::mock::SimulatedBench;
use psu_bench::instrument::{Instrument, Role};
use psu_bench::sweep::Bench;
use std::collections::HashMap;
use std::sync::Arc;

/// Flat parameter mapping from string pairs.
pub fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Two current points (1, 2 A) by two voltage points (0, 1 V), no settling,
/// with `overrides` applied on top.
pub fn sweep_config(overrides: &[(&str, &str)]) -> SweepConfiguration {
    let mut mapping = params(&[
        ("min_current", "1"),
        ("max_current", "2"),
        ("current_step", "1"),
        ("min_voltage", "0"),
        ("max_voltage", "1"),
        ("voltage_step", "1"),
        ("power", "100"),
        ("settle_delay", "0"),
    ]);
    mapping.extend(params(overrides));
    SweepConfiguration::from_params(&mapping).expect("fixture parameters are valid")
}

pub fn instrument(sim: &SimulatedBench, role: Role) -> Instrument {
    let commands: Arc<dyn CommandSet> = match role {
        Role::Psu => Arc::new(ModularScpi),
        Role::Eload => Arc::new(LoadScpi),
        Role::Dmm => Arc::new(GenericScpi),
    };
    Instrument::new(role, Arc::new(sim.endpoint(role)), commands, None)
}

/// Supply and DMM, plus the load when `with_load` is set.
pub fn bench(sim: &SimulatedBench, with_load: bool) -> Bench {
    Bench::new(
        instrument(sim, Role::Psu),
        with_load.then(|| instrument(sim, Role::Eload)),
        Some(instrument(sim, Role::Dmm)),
    )
}

/// (voltage, current) pairs of a sweep output.
pub fn pairs(points: &[psu_bench::sweep::SweepPoint]) -> Vec<(f64, f64)> {
    points.iter().map(|p| (p.voltage, p.current)).collect()
}
