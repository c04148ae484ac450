//! Configuration intake and bench assembly.

mod common;

use common::params;
use psu_bench::config::{BenchConfig, SweepConfiguration};
use psu_bench::instrument::mock::{SimulatedBench, SimulatedFactory};
use psu_bench::instrument::registry::DriverRegistry;
use psu_bench::instrument::Role;
use psu_bench::sweep::Bench;
use psu_bench::BenchError;
use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const BENCH_TOML: &str = r#"
[application]
name = "Integration bench"

[[instruments]]
role = "psu"
driver = "modular"
address = "TCPIP::10.0.0.5::5025::SOCKET"
channel = 2

[[instruments]]
role = "eload"
driver = "eload"
address = "TCPIP::10.0.0.6::5025::SOCKET"

[[instruments]]
role = "dmm"
driver = "generic"
address = "GPIB0::22::INSTR"

[synchronization]
poll_interval = "50ms"
timeout = "5s"

[parameters]
min_current = 0
max_current = "2.5"
current_step = 0.5
min_voltage = 0
max_voltage = 10
voltage_step = 2
power = 20
settle_delay = 0.25
pairing = "series"
"#;

fn write_config(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn loads_file_with_defaults() {
    let file = write_config(BENCH_TOML);
    let config = BenchConfig::load_from(file.path()).unwrap();

    assert_eq!(config.application.log_level, "info");
    assert_eq!(config.instruments.len(), 3);
    assert_eq!(config.instrument(Role::Psu).unwrap().channel, Some(2));

    let poll = config.poll_policy();
    assert_eq!(poll.interval, Duration::from_millis(50));
    assert_eq!(poll.timeout, Duration::from_secs(5));
    assert_eq!(config.retry_policy().max_attempts, 1);

    let sweep = config.sweep_configuration().unwrap();
    assert_eq!(sweep.max_current, 2.5);
    assert_eq!(sweep.current_axis().len(), 6);
    assert_eq!(sweep.voltage_axis().len(), 6);
    assert_eq!(sweep.settle_delay, Duration::from_millis(250));
    assert!(sweep.static_load_current.is_none());
}

#[test]
#[serial]
fn environment_overrides_file() {
    let file = write_config(BENCH_TOML);
    std::env::set_var("PSU_BENCH_APPLICATION__LOG_LEVEL", "debug");
    std::env::set_var("PSU_BENCH_PARAMETERS__MAX_VOLTAGE", "12");
    let loaded = BenchConfig::load_from(file.path());
    std::env::remove_var("PSU_BENCH_APPLICATION__LOG_LEVEL");
    std::env::remove_var("PSU_BENCH_PARAMETERS__MAX_VOLTAGE");

    let config = loaded.unwrap();
    assert_eq!(config.application.log_level, "debug");
    assert_eq!(config.sweep_configuration().unwrap().max_voltage, 12.0);
}

#[test]
#[serial]
fn missing_psu_is_rejected() {
    let psu_block = concat!(
        "[[instruments]]\n",
        "role = \"psu\"\n",
        "driver = \"modular\"\n",
        "address = \"TCPIP::10.0.0.5::5025::SOCKET\"\n",
        "channel = 2\n",
    );
    assert!(BENCH_TOML.contains(psu_block));
    let file = write_config(&BENCH_TOML.replacen(psu_block, "", 1));
    let err = BenchConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, BenchError::Configuration(_)));
    assert!(err.to_string().contains("'psu' instrument is required"));
}

#[test]
fn non_numeric_parameter_names_the_key() {
    let mut mapping = params(&[
        ("min_current", "0"),
        ("max_current", "2"),
        ("current_step", "1"),
        ("min_voltage", "0"),
        ("max_voltage", "10"),
        ("voltage_step", "1"),
        ("power", "lots"),
    ]);
    let err = SweepConfiguration::from_params(&mapping).unwrap_err();
    assert!(err.to_string().contains("'power'"));

    mapping.insert("power".into(), "10".into());
    mapping.insert("voltage_step".into(), "0".into());
    let err = SweepConfiguration::from_params(&mapping).unwrap_err();
    assert!(err.to_string().contains("voltage_step"));
}

#[tokio::test]
#[serial]
async fn assembles_bench_from_configuration() {
    let file = write_config(BENCH_TOML);
    let config = BenchConfig::load_from(file.path()).unwrap();
    let factory = SimulatedFactory::new(SimulatedBench::new());

    let bench = Bench::assemble(&config, &DriverRegistry::with_builtin(), &factory)
        .await
        .unwrap();
    assert_eq!(bench.psu().driver(), "modular");
    assert!(bench.eload().is_some());
    assert_eq!(bench.instruments().count(), 3);

    bench.psu().set_voltage(3.0).await.unwrap();
    assert_eq!(
        factory.bench().commands(Role::Psu),
        vec!["VOLT 3,(@2)".to_string()]
    );
}

#[tokio::test]
#[serial]
async fn unreachable_instrument_is_connection_error() {
    let file = write_config(BENCH_TOML);
    let config = BenchConfig::load_from(file.path()).unwrap();
    let sim = SimulatedBench::new();
    sim.set_unreachable(Role::Dmm);

    let err = Bench::assemble(
        &config,
        &DriverRegistry::with_builtin(),
        &SimulatedFactory::new(sim),
    )
    .await
    .unwrap_err();

    match err {
        BenchError::Connection {
            instrument,
            address,
            ..
        } => {
            assert_eq!(instrument, "dmm");
            assert_eq!(address, "GPIB0::22::INSTR");
        }
        other => panic!("unexpected error: {other}"),
    }
}
