//! psu_bench command-line entry point.
//!
//! ```bash
//! # Validate a bench file without touching hardware
//! psu_bench check --config config/bench.toml
//!
//! # Dry run against the simulated bench
//! psu_bench run --config config/bench.toml --variant voltage_static_load --simulate
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use psu_bench::analysis::{ErrorModel, Quantity};
use psu_bench::config::BenchConfig;
use psu_bench::instrument::endpoint::{ConnectionFactory, TransportFactory};
use psu_bench::instrument::mock::{SimulatedBehaviour, SimulatedBench, SimulatedFactory};
use psu_bench::instrument::registry::DriverRegistry;
use psu_bench::logging;
use psu_bench::report::{self, RunMetadata};
use psu_bench::sweep::controller::SweepController;
use psu_bench::sweep::variant::{SweepPlan, SweepVariant};
use psu_bench::sweep::{Bench, CancelHandle};
use std::path::PathBuf;
use tracing::{info, warn};

/// Power supply accuracy sweeps
#[derive(Parser, Debug)]
#[command(name = "psu_bench", version)]
#[command(about = "Sweep a power supply through its setpoints and check accuracy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one sweep, then write the report
    Run {
        /// Bench configuration file
        #[arg(long, default_value = "config/bench.toml")]
        config: PathBuf,

        /// Sweep variant
        #[arg(long, default_value = "voltage_no_load")]
        variant: SweepVariant,

        /// Use the in-process simulated bench instead of hardware
        #[arg(long)]
        simulate: bool,

        /// Report directory (overrides application.output_dir)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Validate the configuration and exit
    Check {
        /// Bench configuration file
        #[arg(long, default_value = "config/bench.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            variant,
            simulate,
            output,
        } => run(config, variant, simulate, output).await,
        Command::Check { config } => check(config),
    }
}

fn check(path: PathBuf) -> Result<()> {
    let config = BenchConfig::load_from(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    let sweep = config.sweep_configuration()?;
    println!(
        "{}: {} instrument(s), {} current x {} voltage setpoints, power ceiling {} W",
        path.display(),
        config.instruments.len(),
        sweep.current_axis().len(),
        sweep.voltage_axis().len(),
        sweep.power
    );
    for variant in SweepVariant::ALL {
        if let Err(err) = SweepPlan::resolve(variant, &sweep) {
            println!("  {}: unavailable ({})", variant, err);
        }
    }
    Ok(())
}

async fn run(
    path: PathBuf,
    variant: SweepVariant,
    simulate: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = BenchConfig::load_from(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    logging::init(&config.application.log_level);

    let sweep = config.sweep_configuration()?;
    let plan = SweepPlan::resolve(variant, &sweep)?;
    let registry = DriverRegistry::with_builtin();

    let factory: Box<dyn ConnectionFactory> = if simulate {
        info!("using simulated bench");
        let bench = SimulatedBench::with_behaviour(SimulatedBehaviour {
            dmm_offset: 0.0005,
            readback_offset: -0.001,
            shunt_resistance: sweep.shunt_resistance,
            ..Default::default()
        });
        Box::new(SimulatedFactory::new(bench))
    } else {
        Box::new(TransportFactory)
    };
    let mut bench = Bench::assemble(&config, &registry, factory.as_ref()).await?;

    let cancel = CancelHandle::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current point");
            on_signal.cancel();
        }
    });

    let mut controller = SweepController::new(config.poll_policy(), config.retry_policy());
    let result = controller
        .run_sweep(&mut bench, &sweep, variant, &cancel)
        .await?;

    let model = ErrorModel::from_config(&sweep, plan.quantity);
    let records = model.evaluate(&result)?;
    let metadata = RunMetadata::new(
        config.application.name.clone(),
        variant,
        plan.quantity,
        config.parameter_text().into_iter().collect(),
    );
    let dir = output.unwrap_or_else(|| config.application.output_dir.clone());
    let report_path = report::write_csv(&dir, &metadata, &records)?;

    let unit = match plan.quantity {
        Quantity::Voltage => "V",
        Quantity::Current => "A",
    };
    println!("{} rows -> {}", records.len(), report_path.display());
    for group in report::summary(&records, &result.points, plan.outer_axis) {
        println!(
            "  group {} @ {:.4}: programming {}/{} pass, readback {}/{} pass ({})",
            group.key,
            group.outer_setpoint,
            group.counts.programming_pass,
            group.counts.rows,
            group.counts.readback_pass,
            group.counts.rows,
            unit
        );
    }
    Ok(())
}
