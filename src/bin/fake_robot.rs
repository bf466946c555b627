//! Robot simulator for driver station testing
//!
//! Answers control packets with status packets and serves the console port,
//! so the daemon can be exercised with team number 0 on one machine.
//!
//! - Mirrors enabled / mode from the control stream
//! - Latches estop on a rising estop bit until a reboot request
//! - A reboot request goes silent for a moment, like a real controller
//! - The console port sends version, power counters and periodic output

use anyhow::{Context, Result};
use clap::Parser;
use dsd::codec::{CanMetrics, ControlPacket, StatusExtension, StatusFlags, StatusPacket};
use dsd::console::ConsoleMessage;
use dsd::types::VersionInfo;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const REBOOT_SILENCE: Duration = Duration::from_millis(1500);
const RESTART_DOWNTIME: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "fake_robot")]
#[command(about = "Simulated robot controller for driver station testing")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    #[arg(long, default_value_t = 1110)]
    control_port: u16,

    /// Port status packets are sent to on the station
    #[arg(long, default_value_t = 1150)]
    status_port: u16,

    #[arg(long, default_value_t = 1740)]
    console_port: u16,

    /// Reported battery voltage
    #[arg(long, default_value_t = 12.4)]
    battery: f64,

    /// Interval between console output lines
    #[arg(long, default_value_t = 1000)]
    stdout_period_ms: u64,
}

/// Controller-side state driven by control packets
struct RobotSim {
    battery: f64,
    estopped: bool,
    last_estop_bit: Option<bool>,
    silent_until: Option<Instant>,
    code_down_until: Option<Instant>,
}

impl RobotSim {
    fn new(battery: f64) -> Self {
        Self {
            battery,
            estopped: false,
            last_estop_bit: None,
            silent_until: None,
            code_down_until: None,
        }
    }

    /// Status reply for one control packet; None while rebooting
    fn handle(&mut self, control: &ControlPacket, now: Instant) -> Option<StatusPacket> {
        if let Some(until) = self.silent_until {
            if now < until {
                return None;
            }
            info!("Simulated reboot complete");
            self.silent_until = None;
            // A fresh boot ignores an estop bit the station is still holding
            self.last_estop_bit = None;
        }

        if control.requests.reboot {
            info!("Reboot requested");
            self.estopped = false;
            self.silent_until = Some(now + REBOOT_SILENCE);
            return None;
        }
        if control.requests.restart_code {
            info!("Code restart requested");
            self.code_down_until = Some(now + RESTART_DOWNTIME);
        }

        let estop_bit = control.control.estop;
        if estop_bit && self.last_estop_bit == Some(false) {
            warn!("Emergency stop received");
            self.estopped = true;
        }
        self.last_estop_bit = Some(estop_bit);

        let code_running = self.code_down_until.map_or(true, |until| now >= until);
        Some(StatusPacket {
            sequence: control.sequence,
            status: StatusFlags {
                estopped: self.estopped,
                code_running,
                enabled: control.control.enabled && code_running && !self.estopped,
                mode: control.control.mode,
                ..Default::default()
            },
            trace: 0,
            battery_voltage: self.battery,
            extensions: diagnostics(control.sequence),
        })
    }
}

fn diagnostics(sequence: u16) -> Vec<StatusExtension> {
    // Slow drift so consumers see diagnostics change
    let wobble = (sequence % 100) as f32 / 10.0;
    vec![
        StatusExtension::Cpu(vec![20.0 + wobble, 35.0 - wobble]),
        StatusExtension::Ram { free: 160_000_000, total: 256_000_000 },
        StatusExtension::Disk { free: 300_000_000, total: 512_000_000 },
        StatusExtension::Can(CanMetrics { utilization: 0.18, ..Default::default() }),
    ]
}

async fn run_control(args: &Args) -> Result<()> {
    let socket = UdpSocket::bind((args.bind, args.control_port))
        .await
        .with_context(|| format!("Failed to bind control port {}", args.control_port))?;
    info!("Listening for control packets on {}", socket.local_addr()?);

    let mut sim = RobotSim::new(args.battery);
    let mut buf = vec![0u8; 1500];
    let mut last_enabled = false;
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        let control = match ControlPacket::decode(&buf[..len]) {
            Ok(control) => control,
            Err(e) => {
                debug!("Ignoring malformed control packet from {}: {}", from, e);
                continue;
            }
        };

        if control.control.enabled != last_enabled {
            info!(
                "Robot {} in {} mode",
                if control.control.enabled { "enabled" } else { "disabled" },
                control.control.mode
            );
            last_enabled = control.control.enabled;
        }

        if let Some(status) = sim.handle(&control, Instant::now()) {
            let target = SocketAddr::new(from.ip(), args.status_port);
            if let Err(e) = socket.send_to(&status.encode(), target).await {
                debug!("Status send to {} failed: {}", target, e);
            }
        }
    }
}

async fn run_console(args: &Args) -> Result<()> {
    let listener = TcpListener::bind((args.bind, args.console_port))
        .await
        .with_context(|| format!("Failed to bind console port {}", args.console_port))?;
    info!("Console listening on {}", listener.local_addr()?);

    let period = Duration::from_millis(args.stdout_period_ms.max(10));
    loop {
        let (stream, peer) = listener.accept().await?;
        info!("Console client connected from {}", peer);
        tokio::spawn(async move {
            if let Err(e) = serve_console(stream, period).await {
                info!("Console client {} disconnected: {}", peer, e);
            }
        });
    }
}

async fn serve_console(mut stream: TcpStream, period: Duration) -> Result<()> {
    let started = Instant::now();
    let greeting = [
        ConsoleMessage::Version(VersionInfo {
            image_version: "FRC_roboRIO_2024_v2.1".to_string(),
            wpilib_version: "2024.3.2".to_string(),
            rio_version: "8.0.0".to_string(),
        }),
        ConsoleMessage::DisableFaults { comms: 0, brownout_12v: 1 },
        ConsoleMessage::RailFaults { v6: 0, v5: 0, v3_3: 0 },
    ];
    for message in &greeting {
        stream.write_all(&message.encode()).await?;
    }

    let mut ticker = tokio::time::interval(period);
    let mut sequence: u16 = 0;
    loop {
        ticker.tick().await;
        sequence = sequence.wrapping_add(1);
        let timestamp = started.elapsed().as_secs_f32();
        let message = if sequence % 10 == 0 {
            ConsoleMessage::Error {
                timestamp,
                sequence,
                occurrences: 1,
                code: 44004,
                is_error: false,
                details: "Loop time of 0.02s overrun".to_string(),
                location: "edu.wpi.first.wpilibj.IterativeRobotBase.printLoopOverrunMessage".to_string(),
                call_stack: String::new(),
            }
        } else {
            ConsoleMessage::Stdout {
                timestamp,
                sequence,
                text: format!("Robot heartbeat {}", sequence),
            }
        };
        stream.write_all(&message.encode()).await?;
    }
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

    info!("Simulated robot controller");

    tokio::select! {
        result = run_control(&args) => result.context("Control loop failed")?,
        result = run_console(&args) => result.context("Console server failed")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
