//! JSON output for operator commands
//!
//! One JSON object per line on stdout: command results, errors and status
//! reports, for external tools that drive the daemon over stdin.

use crate::gamepad::SlotView;
use crate::safety::SafetyState;
use crate::types::{Alliance, ConnectionStatus, Mode, RobotState, SystemInfo};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as f64 seconds since UNIX epoch, rounded to microseconds
pub fn current_timestamp() -> f64 {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();

    (timestamp * 1_000_000.0).round() / 1_000_000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Accepted,
    Refused,
    Failed,
}

/// Outcome of one operator command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResultEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Command line as typed
    pub command: String,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub error: String,
}

/// Snapshot answered to a `status` command
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub team_number: u32,
    pub state: SafetyState,
    pub mode: Mode,
    pub alliance: Alliance,
    pub game_data: String,
    pub robot: RobotState,
    pub connection: ConnectionStatus,
    /// Address set with the `target` command, if any
    pub target_address: Option<String>,
    pub system: SystemInfo,
}

/// Slot listing answered to a `gamepads` command
#[derive(Debug, Clone, Serialize)]
pub struct SlotListEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub slots: Vec<SlotView>,
}

impl CommandResultEvent {
    pub fn new(command: &str, status: CommandStatus, message: Option<String>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "command_result".to_string(),
            command: command.to_string(),
            status,
            message,
        }
    }

    pub fn accepted(command: &str) -> Self {
        Self::new(command, CommandStatus::Accepted, None)
    }

    pub fn refused(command: &str, reason: &str) -> Self {
        Self::new(command, CommandStatus::Refused, Some(reason.to_string()))
    }

    pub fn failed(command: &str, error: &str) -> Self {
        Self::new(command, CommandStatus::Failed, Some(error.to_string()))
    }
}

impl ErrorEvent {
    pub fn new(error: &str) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "error".to_string(),
            error: error.to_string(),
        }
    }

    /// Input line that could not be parsed into a command
    pub fn parse_error(error: &str) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "parse_error".to_string(),
            error: error.to_string(),
        }
    }
}

impl SlotListEvent {
    pub fn new(slots: Vec<SlotView>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "gamepads".to_string(),
            slots,
        }
    }
}

/// Output a JSON event to stdout
pub fn output_event<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{}", json);
    }
}

/// Convenience functions for outputting specific event types
pub mod output {
    use super::*;

    pub fn command_result(event: CommandResultEvent) {
        output_event(&event);
    }

    pub fn error(event: ErrorEvent) {
        output_event(&event);
    }

    pub fn command_accepted(command: &str) {
        command_result(CommandResultEvent::accepted(command));
    }

    pub fn command_refused(command: &str, reason: &str) {
        command_result(CommandResultEvent::refused(command, reason));
    }

    pub fn command_failed(command: &str, error_msg: &str) {
        command_result(CommandResultEvent::failed(command, error_msg));
    }

    pub fn parse_error(error_msg: &str) {
        error(ErrorEvent::parse_error(error_msg));
    }

    pub fn status(report: StatusReport) {
        output_event(&report);
    }

    pub fn slots(slots: Vec<SlotView>) {
        output_event(&SlotListEvent::new(slots));
    }
}
