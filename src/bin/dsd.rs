//! Driver station daemon
//!
//! - Connects to the robot for the configured team number
//! - Reads operator commands from stdin, one per line
//! - Prints station events and command results as JSON on stdout
//! - Logs to stderr; set RUST_LOG to change verbosity

use anyhow::{Context, Result};
use clap::Parser;
use dsd::{
    log_writer::LogWriter, CommandStream, ConsoleTelemetry, DaemonConfig, DriverStation,
    EventMonitor, NoOpTelemetry, SystemMonitor, TelemetryPublisher,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dsd")]
#[command(about = "Robot driver station daemon - control stream, safety gating and robot telemetry")]
#[command(version)]
struct Args {
    /// Path to the daemon configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Team number, overriding the configuration file (0 = local simulator)
    #[arg(short, long)]
    team: Option<u32>,

    /// Do not print station events, only command results
    #[arg(short, long)]
    quiet: bool,

    /// Pretty-print event JSON
    #[arg(long)]
    pretty: bool,
}

impl Args {
    fn get_config_path(&self) -> String {
        self.config
            .clone()
            .or_else(|| std::env::var("DEFAULT_CONFIG_PATH").ok())
            .unwrap_or_else(|| "config/default_config.yaml".to_string())
    }
}

fn load_config(args: &Args) -> Result<DaemonConfig> {
    let path = args.get_config_path();
    let mut config = if std::path::Path::new(&path).exists() {
        info!("Using config: {}", path);
        DaemonConfig::load_from_path(&path).with_context(|| format!("Failed to load {}", path))?
    } else if args.config.is_some() {
        anyhow::bail!("Config file {} does not exist", path);
    } else {
        info!("No config at {}, using defaults", path);
        DaemonConfig::default()
    };

    if let Some(team) = args.team {
        config.set_team_number(team);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    info!("Robot Driver Station");
    info!("{}", "=".repeat(50));

    let config = load_config(&args)?;
    let station = Arc::new(DriverStation::new(config.clone()).context("Failed to create driver station")?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = Vec::new();

    let publisher: Arc<dyn TelemetryPublisher> = if args.quiet {
        Arc::new(NoOpTelemetry)
    } else if args.pretty {
        Arc::new(ConsoleTelemetry::pretty())
    } else {
        Arc::new(ConsoleTelemetry::new())
    };
    let monitor = EventMonitor::new(station.events(), publisher, config.timing().publish_rate_hz());
    background.push(tokio::spawn(monitor.run(shutdown_rx.clone())));

    if let Some(period) = config.timing().system_info_period() {
        let host = SystemMonitor::new(station.events()).with_period(period);
        background.push(tokio::spawn(host.run(shutdown_rx.clone())));
    }

    if let Some(dir) = config.console().log_dir() {
        match LogWriter::create(&dir).await {
            Ok(writer) => {
                let console = station.subscribe_console();
                background.push(tokio::spawn(writer.run(console, shutdown_rx.clone())));
            }
            Err(e) => warn!("Console log file disabled: {}", e),
        }
    }

    if let Err(e) = station.start().await {
        error!("Driver station failed to start: {:#}", e);
        error!("Make sure:");
        error!("   - The robot (or fake_robot for team 0) is running");
        error!("   - The status port is not used by another driver station");
        return Err(e);
    }
    info!("Driver station ready for team {}", station.team_number());

    let mut stream = CommandStream::new(station.clone());
    let result = stream.run().await;
    if let Err(e) = &result {
        error!("Command stream error: {}", e);
    }

    info!("Performing graceful shutdown");
    station.disable();
    station.shutdown().await;
    let _ = shutdown_tx.send(true);
    for handle in background {
        let _ = handle.await;
    }

    info!("Shutdown complete");
    result
}
