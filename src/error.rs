//! Error types for driver station operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DsError>;

#[derive(Error, Debug)]
pub enum DsError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Wire protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Command refused: {0}")]
    Refused(#[from] CommandRefused),

    #[error("Input device error: {0}")]
    Input(String),

    #[error("Tokio task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

/// Decode failures for packets and console frames.
///
/// A datagram or frame that fails to decode is dropped; it never counts as
/// evidence of a healthy link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer too short: needed {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },

    #[error("unknown tag 0x{0:02X}")]
    UnknownTag(u8),

    #[error("invalid value {value} for field '{field}'")]
    InvalidField { field: &'static str, value: u32 },
}

impl CodecError {
    pub(crate) fn invalid(field: &'static str, value: impl Into<u32>) -> Self {
        CodecError::InvalidField { field, value: value.into() }
    }
}

/// Reasons a command is rejected by the safety state machine.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRefused {
    #[error("robot link is down")]
    Disconnected,

    #[error("emergency stop is latched until the robot reconnects")]
    EStopped,

    #[error("robot must be disabled first")]
    Enabled,

    #[error("slot {0} is out of range")]
    InvalidSlot(usize),

    #[error("slot {0} has no device to lock")]
    EmptySlot(usize),
}
