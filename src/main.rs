//! sheet_daq: run an I-V sweep and report sheet resistance.

use anyhow::{Context, Result};
use clap::Parser;
use sheet_daq::config::{AppConfig, Driver, LoggingConfig, DEFAULT_CONFIG_PATH};
use sheet_daq::controller::SweepController;
use sheet_daq::data::{CsvRecorder, CurveFitter};
use sheet_daq::instrument::{Keithley2450, MockSourceMeter, SourceMeter};
use sheet_daq::pipeline::{MeasurementOutcome, MeasurementPipeline, SweepOutcome};
use sheet_daq::plan::SweepPlan;
use sheet_daq::sink::TracingSink;
use sheet_daq::timeout::TimeoutEstimator;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Sourcemeter I-V sweep and van der Pauw sheet resistance.
#[derive(Parser, Debug)]
#[command(name = "sheet_daq", version, about)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the simulated sourcemeter instead of hardware
    #[arg(long)]
    mock: bool,

    /// Forward sweep only, even if the configuration asks for both directions
    #[arg(long)]
    single: bool,

    /// Write each fitted sweep as CSV into this directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let mut config: AppConfig = AppConfig::figment_for(&cli.config)
        .extract()
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if cli.mock {
        config.instrument.driver = Driver::Mock;
    }
    if cli.single {
        config.sweep.dual_direction = false;
    }
    if let Some(dir) = cli.output {
        config.output.csv_dir = Some(dir);
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.logging);

    let plan = config.sweep_plan()?;
    let estimator = config.timeout_estimator()?;
    let recorder = config.output.csv_dir.clone().map(CsvRecorder::new);
    if let Some(recorder) = &recorder {
        info!("Recording fitted sweeps to {}", recorder.directory().display());
    }
    let coverage_factor = config.analysis.coverage_factor;
    info!("Planned sweep: {}", plan);
    info!("Worst-case sweep time: {:?}", estimator.estimate_plan(&plan));

    let outcome = match config.instrument.driver {
        Driver::Mock => {
            let mock = &config.instrument.mock;
            let device = MockSourceMeter::new()
                .with_resistance(mock.resistance_ohms)
                .with_noise(mock.noise, mock.seed)
                .with_point_time(Duration::from_millis(mock.point_time_ms));
            measure(device, estimator, plan, recorder).await?
        }
        Driver::Keithley2450 => {
            let descriptor = config.instrument.descriptor();
            let device = Keithley2450::connect(
                &descriptor,
                config.instrument.connect_timeout(),
                config.instrument.io_timeout(),
            )
            .await
            .with_context(|| format!("Failed to connect to {}", descriptor))?;
            measure(device, estimator, plan, recorder).await?
        }
    };

    print_summary(&outcome, coverage_factor);
    Ok(outcome.is_success())
}

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn measure<D: SourceMeter + 'static>(
    device: D,
    estimator: TimeoutEstimator,
    plan: SweepPlan,
    recorder: Option<CsvRecorder>,
) -> Result<MeasurementOutcome> {
    let sink = Arc::new(TracingSink);
    let controller = SweepController::with_sink(device, estimator, sink.clone());
    let mut pipeline = MeasurementPipeline::new(controller.clone(), CurveFitter::new(), sink);
    if let Some(recorder) = recorder {
        pipeline = pipeline.with_recorder(recorder);
    }
    let pipeline = Arc::new(pipeline);

    let interrupt = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling sweep");
                pipeline.cancel();
            }
        })
    };

    let outcome = controller
        .scoped(|_| async move { Ok(pipeline.measure(plan).await) })
        .await;
    interrupt.abort();
    Ok(outcome?)
}

fn print_summary(outcome: &MeasurementOutcome, coverage_factor: f64) {
    print_leg("forward", &outcome.forward, coverage_factor);
    if let Some(reverse) = &outcome.reverse {
        print_leg("reverse", reverse, coverage_factor);
    }
}

fn print_leg(label: &str, leg: &SweepOutcome, coverage_factor: f64) {
    match leg {
        SweepOutcome::Fitted(report) => {
            let fit = &report.fit;
            let (r_low, r_high) = fit.resistance_interval(coverage_factor);
            let (rs_low, rs_high) = fit.sheet_resistance_interval(coverage_factor);
            println!(
                "{} sweep ({} points, {} saturated):",
                label,
                fit.points,
                report.data.saturated_count()
            );
            println!(
                "  R   = {:.6e} Ω  [{:.6e}, {:.6e}] (k = {})",
                fit.resistance, r_low, r_high, coverage_factor
            );
            println!(
                "  R_s = {:.6e} Ω/□ [{:.6e}, {:.6e}] (k = {})",
                fit.sheet_resistance, rs_low, rs_high, coverage_factor
            );
            println!("  r²  = {:.6}", fit.r_squared);
        }
        SweepOutcome::FitFailed { data, error } => {
            println!("{} sweep: {} raw samples, fit failed: {}", label, data.len(), error);
        }
        SweepOutcome::Failed(error) => {
            let retained = error.partial_data().map_or(0, |data| data.len());
            println!("{} sweep failed: {} ({} samples retained)", label, error, retained);
        }
    }
}
