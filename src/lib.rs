//! dsd - robot competition driver station
//!
//! Commands a remote robot controller over the local network: a 20 ms
//! control stream with enable gating, status reception with a watchdog, a
//! console channel for robot output, and input devices mapped into the
//! outgoing packets.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use dsd::{DaemonConfig, DriverStation, Mode};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = DaemonConfig::default();
//!     config.set_team_number(245);
//!
//!     let station = DriverStation::new(config)?;
//!     station.start().await?;
//!
//!     station.set_mode(Mode::Autonomous)?;
//!     if let Err(reason) = station.enable() {
//!         println!("Not enabled: {}", reason);
//!     }
//!
//!     station.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **DriverStation**: owns transports and exposes the command surface
//! - **SafetyController**: link health, enable gating, estop latch
//! - **ControlTransmitter / StatusReceiver**: the two UDP flows
//! - **ConsoleChannel**: robot console output over TCP
//! - **InputAggregator**: six input slots feeding every control packet
//! - **StationEvents**: per-entity notification channels
//! - **SystemMonitor**: host CPU and battery
//! - **TelemetryPublisher**: transport-agnostic event sink

pub mod codec;
pub mod config;
pub mod console;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod events;
pub mod game_data;
pub mod gamepad;
pub mod json_output;
pub mod log_writer;
pub mod monitoring;
pub mod network;
pub mod receiver;
pub mod safety;
pub mod stream;
pub mod system_info;
pub mod telemetry;
pub mod transmitter;
pub mod types;

// High-level exports for easy usage
pub use config::DaemonConfig;
pub use controller::DriverStation;
pub use error::{CodecError, CommandRefused, DsError, Result};
pub use events::StationEvents;
pub use safety::{SafetyController, SafetyState};
pub use stream::CommandStream;
pub use telemetry::{ConsoleTelemetry, NoOpTelemetry, TelemetryPublisher};
pub use types::{
    Alliance, ConnectionStatus, DiagnosticData, GamepadInfo, JoystickState, LogEntry, Mode,
    PowerData, RobotState, SystemInfo, VersionInfo,
};

// Component exports for advanced usage
pub use codec::{ControlPacket, StatusPacket};
pub use console::{ConsoleChannel, ConsoleMessage, FrameDecoder};
pub use gamepad::{InputAggregator, InputBackend, InputEvent, ScriptedBackend, SlotView};
pub use monitoring::{EventMonitor, MonitorOutput};
pub use receiver::StatusReceiver;
pub use system_info::SystemMonitor;
pub use transmitter::{ControlSources, ControlTransmitter};
