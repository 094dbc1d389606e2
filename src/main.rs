use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use log::{error, warn, LevelFilter};

use imu_fixture::{
    config::FixtureConfig,
    logging::{category, FixtureLogger},
    orchestrator::{RunObserver, TestOrchestrator},
    port_detect,
    report::{ProductCode, RunReport},
    serial_link::SerialSession,
    telemetry::{self, TcpTelemetrySession},
    types::{RunOutcome, RunState, TelemetrySample},
    wifi,
};

const DEFAULT_CONFIG: &str = "fixture.toml";

#[derive(Debug, Parser)]
#[command(name = "imu_fixture")]
#[command(about = "Wheel unit + IMU bring-up and validation fixture")]
struct Cli {
    /// TOML config; `fixture.toml` in the working directory when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full bring-up and validation sequence for one unit.
    Run(RunArgs),
    /// List serial port candidates.
    Ports,
    /// Probe candidates and report which port answers as motor or sensor.
    Detect,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long = "product-code")]
    product_code: String,
    #[arg(long = "report-dir")]
    report_dir: Option<PathBuf>,
    #[arg(long = "no-save")]
    no_save: bool,
}

struct ConsolePresenter;

impl RunObserver for ConsolePresenter {
    fn progress(&self, message: &str) {
        println!("  > {message}");
    }

    fn state_changed(&self, state: RunState) {
        println!("[{state:?}]");
    }

    fn sample(&self, sample: &TelemetrySample) {
        println!(
            "  {} roll={:8.2} pitch={:8.2} yaw={:8.2} gyro_x={:8.2} gyro_y={:8.2}",
            sample.timestamp.format("%H:%M:%S%.3f"),
            sample.roll,
            sample.pitch,
            sample.yaw,
            sample.gyro.x,
            sample.gyro.y
        );
    }

    fn finished(&self, outcome: &RunOutcome) {
        if let Some(verdict) = outcome.verdict() {
            println!("  channel      min        max        range");
            for c in &verdict.channels {
                let flag = if verdict.failing_channels.contains(&c.channel) { " !" } else { "" };
                println!(
                    "  {:<8} {:>10.2} {:>10.2} {:>10.2}{flag}",
                    c.channel, c.min, c.max, c.range
                );
            }
        }
        println!("RESULT: {} - {}", outcome.label(), outcome.reason());
    }
}

fn exit_code(outcome: &RunOutcome) -> ExitCode {
    match outcome {
        RunOutcome::Passed(_) => ExitCode::SUCCESS,
        RunOutcome::Failed { .. } => ExitCode::from(1),
        RunOutcome::Stopped => ExitCode::from(2),
    }
}

fn load_config(cli: &Cli) -> Result<FixtureConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    FixtureConfig::load(Some(Path::new(&path)))
        .with_context(|| format!("failed to load config {}", path.display()))
}

async fn resolve_ports(config: &mut FixtureConfig) -> Result<()> {
    let missing = config.motor.port.trim().is_empty() || config.sensor.port.trim().is_empty();
    if !missing || !config.auto_detect_ports {
        return Ok(());
    }
    let baud = config.motor.baud;
    let detected = tokio::task::spawn_blocking(move || port_detect::detect_roles(baud))
        .await
        .context("port detection task failed")?;
    if config.motor.port.trim().is_empty() {
        if let Some(port) = detected.motor {
            config.motor.port = port;
        }
    }
    if config.sensor.port.trim().is_empty() {
        if let Some(port) = detected.sensor {
            config.sensor.port = port;
        }
    }
    Ok(())
}

async fn run_fixture(cli: &Cli, args: &RunArgs) -> Result<ExitCode> {
    let product_code = ProductCode::parse(&args.product_code)?;
    let mut config = load_config(cli)?;
    resolve_ports(&mut config).await?;
    config.validate().context("config rejected")?;

    let telemetry = telemetry::shared(TcpTelemetrySession::new(
        config.tcp.session_timeouts(),
        config.tcp.read_buffer,
    ));
    let associator = wifi::system_associator(
        config.wifi.profile_dir.clone(),
        Duration::from_millis(config.wifi.settle_ms),
    );
    let mut orchestrator = TestOrchestrator::new(
        config.run_config(),
        SerialSession::hardware(),
        telemetry,
        Arc::new(associator),
    )
    .with_observer(Arc::new(ConsolePresenter));

    let stop = orchestrator.stop_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(target: category::SYSTEM, "interrupt received, stopping run");
            stop.stop();
        }
    });

    println!("product code: {}", product_code.as_str());
    let started_at = Local::now();
    let result = orchestrator.run().await;
    ctrl_c.abort();

    if config.report.auto_save && !args.no_save {
        let dir = args
            .report_dir
            .clone()
            .unwrap_or_else(|| config.report.data_dir.clone());
        let report = RunReport::new(
            &product_code,
            started_at,
            &result.outcome,
            result.descriptor.as_ref(),
            orchestrator.samples(),
        );
        match report.save(&dir) {
            Ok(path) => println!("report: {}", path.display()),
            Err(err) => error!(target: category::FILE_IO, "report not saved: {err:#}"),
        }
    }

    Ok(exit_code(&result.outcome))
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    let level = LevelFilter::from_str(&config.logging.level).unwrap_or(LevelFilter::Info);
    FixtureLogger::install(level, config.logging.json_path.clone())?;

    match &cli.command {
        Commands::Run(args) => run_fixture(&cli, args).await,
        Commands::Ports => {
            let candidates = port_detect::list_candidates();
            if candidates.is_empty() {
                println!("no serial port candidates found");
            }
            for candidate in candidates {
                println!("{candidate}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Detect => {
            let baud = config.motor.baud;
            let detected = tokio::task::spawn_blocking(move || port_detect::detect_roles(baud))
                .await
                .context("port detection task failed")?;
            println!("motor:  {}", detected.motor.as_deref().unwrap_or("<not found>"));
            println!("sensor: {}", detected.sensor.as_deref().unwrap_or("<not found>"));
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}
