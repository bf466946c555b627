//! Station-side data model
//!
//! Every entity here is a point-in-time value: it starts at its default,
//! gets overwritten in place as packets and commands arrive, and returns to
//! its default only when the transports are rebuilt for a new team number.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Robot operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    Teleoperated,
    Autonomous,
    Test,
}

impl Mode {
    /// Mode bits as carried in the low two bits of control and status bytes
    pub fn to_bits(self) -> u8 {
        match self {
            Mode::Teleoperated => 0x00,
            Mode::Test => 0x01,
            Mode::Autonomous => 0x02,
        }
    }

    /// Decode the low two bits; `0b11` is not a mode
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0x03 {
            0x00 => Some(Mode::Teleoperated),
            0x01 => Some(Mode::Test),
            0x02 => Some(Mode::Autonomous),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Teleoperated => "teleoperated",
            Mode::Autonomous => "autonomous",
            Mode::Test => "test",
        };
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "teleop" | "teleoperated" => Ok(Mode::Teleoperated),
            "auto" | "autonomous" => Ok(Mode::Autonomous),
            "test" => Ok(Mode::Test),
            other => Err(format!("Unknown mode: {}", other)),
        }
    }
}

/// Alliance color and driver station number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Alliance {
    #[default]
    Red1,
    Red2,
    Red3,
    Blue1,
    Blue2,
    Blue3,
}

impl Alliance {
    pub fn to_byte(self) -> u8 {
        match self {
            Alliance::Red1 => 0,
            Alliance::Red2 => 1,
            Alliance::Red3 => 2,
            Alliance::Blue1 => 3,
            Alliance::Blue2 => 4,
            Alliance::Blue3 => 5,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Alliance::Red1),
            1 => Some(Alliance::Red2),
            2 => Some(Alliance::Red3),
            3 => Some(Alliance::Blue1),
            4 => Some(Alliance::Blue2),
            5 => Some(Alliance::Blue3),
            _ => None,
        }
    }

    /// Station number within the alliance (1..=3)
    pub fn station(self) -> u8 {
        self.to_byte() % 3 + 1
    }

    pub fn is_red(self) -> bool {
        self.to_byte() < 3
    }
}

impl FromStr for Alliance {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "red1" => Ok(Alliance::Red1),
            "red2" => Ok(Alliance::Red2),
            "red3" => Ok(Alliance::Red3),
            "blue1" => Ok(Alliance::Blue1),
            "blue2" => Ok(Alliance::Blue2),
            "blue3" => Ok(Alliance::Blue3),
            other => Err(format!("Unknown alliance: {}", other)),
        }
    }
}

/// Robot state as seen by the station
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RobotState {
    pub connected: bool,
    pub code_running: bool,
    pub enabled: bool,
    pub estopped: bool,
    pub mode: Mode,
    pub battery_voltage: f64,
    pub brownout: bool,
    pub sequence_number: u16,
}

/// Best-effort link indicators
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub enet_link: bool,
    pub enet_ip: Option<String>,
    pub radio: bool,
    /// Watchdog-derived: true only while status packets keep arriving
    pub robot: bool,
    pub robot_ip: Option<String>,
    pub fms: bool,
    pub wifi: bool,
    pub usb: bool,
}

/// Controller resource usage and CAN bus health
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DiagnosticData {
    pub cpu_usage: f64,
    pub ram_usage: f64,
    pub disk_usage: f64,
    pub can_utilization: f64,
    pub can_bus_off: u32,
    pub can_tx_full: u32,
    pub can_rx_error: u32,
    pub can_tx_error: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionInfo {
    pub image_version: String,
    pub wpilib_version: String,
    pub rio_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PowerData {
    pub disable_count_comms: u16,
    pub disable_count_12v: u16,
    pub rail_faults_6v: u16,
    pub rail_faults_5v: u16,
    pub rail_faults_3v3: u16,
}

/// Load and power of the machine running the station
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Average over all cores, 0-100
    pub cpu_usage: f32,
    /// None when the machine has no battery
    pub battery_percent: Option<f32>,
    pub charging: bool,
}

/// One line of robot console output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Seconds since the console connection was established
    pub timestamp: f64,
    pub message: String,
    pub is_error: bool,
    pub is_warning: bool,
    pub sequence: u16,
}

/// Per-tick input values for one slot
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JoystickState {
    pub axes: Vec<f32>,
    pub buttons: Vec<bool>,
    /// Angles in degrees, -1 when released
    pub povs: Vec<i16>,
}

impl JoystickState {
    /// Layout of a typical gamepad: 6 axes, 16 buttons, 1 POV hat
    pub fn gamepad() -> Self {
        Self {
            axes: vec![0.0; 6],
            buttons: vec![false; 16],
            povs: vec![-1],
        }
    }
}

/// Input device as reported to consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GamepadInfo {
    pub id: usize,
    pub name: String,
    pub slot: usize,
    pub axes: Vec<f32>,
    pub buttons: Vec<bool>,
    pub povs: Vec<i16>,
    pub locked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bits() {
        assert_eq!(Mode::from_bits(Mode::Autonomous.to_bits()), Some(Mode::Autonomous));
        assert_eq!(Mode::from_bits(Mode::Test.to_bits()), Some(Mode::Test));
        assert_eq!(Mode::from_bits(0x84), Some(Mode::Teleoperated));
        assert_eq!(Mode::from_bits(0x03), None);
    }

    #[test]
    fn test_alliance_parsing() {
        assert_eq!("Blue2".parse::<Alliance>(), Ok(Alliance::Blue2));
        assert_eq!(Alliance::Blue2.station(), 2);
        assert!(!Alliance::Blue2.is_red());
        assert_eq!(Alliance::from_byte(6), None);
        assert!("green1".parse::<Alliance>().is_err());
    }
}
