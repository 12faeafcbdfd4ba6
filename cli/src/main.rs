//! Lockstep co-simulation runner.
//!
//! ```bash
//! lockstep scenario.json
//! RUST_LOG=lockstep_core=debug lockstep scenario.json --seed 7 --report out.json
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use lockstep_core::{Launcher, RunReport, Scenario};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lockstep")]
#[command(version, about = "Run a co-simulation scenario in conservative lockstep", long_about = None)]
struct Args {
    /// Scenario file (JSON)
    scenario: PathBuf,

    /// Override the scenario's global seed
    #[arg(long)]
    seed: Option<u64>,

    /// Override the scenario's duration, in microseconds
    #[arg(long)]
    duration_us: Option<u64>,

    /// Write the full JSON report here instead of stdout
    #[arg(long)]
    report: Option<PathBuf>,

    /// Include every emitted and delivered event in the report
    #[arg(long)]
    record_events: bool,
}

fn print_summary(report: &RunReport) {
    eprintln!(
        "{} steps to t={}us in {:.3}s: {} emitted, {} delivered, {} dropped, {} unroutable, {} in flight",
        report.steps,
        report.final_time_us,
        report.wall_time_us as f64 / 1e6,
        report.emitted,
        report.delivered,
        report.dropped,
        report.unroutable,
        report.in_flight,
    );
    if let (Some(min), Some(max)) = (report.network.min_latency_us, report.network.max_latency_us) {
        eprintln!(
            "network latency: min {min}us, mean {:.1}us, max {max}us",
            report.network.mean_latency_us
        );
    }
}

fn run(args: Args) -> Result<()> {
    let mut scenario = Scenario::load(&args.scenario)
        .with_context(|| format!("loading scenario {}", args.scenario.display()))?;
    if let Some(seed) = args.seed {
        scenario.seed = seed;
    }
    if let Some(duration_us) = args.duration_us {
        scenario.duration_us = duration_us;
    }
    scenario.record_events |= args.record_events;

    info!(scenario = %args.scenario.display(), seed = scenario.seed, "loaded scenario");
    let report = Launcher::new(scenario)
        .and_then(|launcher| launcher.run())
        .with_context(|| format!("running scenario {}", args.scenario.display()))?;
    print_summary(&report);

    let json = serde_json::to_string_pretty(&report).context("serializing run report")?;
    match &args.report {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing report {}", path.display()))?
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,lockstep_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("lockstep: {e:#}");
            ExitCode::FAILURE
        }
    }
}
