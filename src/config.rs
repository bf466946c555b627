//! Daemon configuration loading
//!
//! Every section and field is optional; accessors fall back to the protocol
//! defaults so an empty file is a valid configuration.

use crate::error::{DsError, Result};
use crate::types::Alliance;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub const CONTROL_PORT: u16 = 1110;
pub const STATUS_PORT: u16 = 1150;
pub const CONSOLE_PORT: u16 = 1740;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DaemonConfig {
    pub station: Option<StationConfig>,
    pub network: Option<NetworkConfig>,
    pub timing: Option<TimingConfig>,
    pub console: Option<ConsoleConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StationConfig {
    pub team_number: Option<u32>,
    pub alliance: Option<String>,
    pub game_data: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NetworkConfig {
    pub control_port: Option<u16>,
    pub status_port: Option<u16>,
    pub console_port: Option<u16>,
    pub discovery_timeout_ms: Option<u64>,
    /// Skip discovery and talk to this address
    pub robot_address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TimingConfig {
    pub tick_period_ms: Option<u64>,
    pub watchdog_timeout_ms: Option<u64>,
    pub input_poll_ms: Option<u64>,
    pub publish_rate_hz: Option<u32>,
    /// Host CPU / battery sampling, 0 turns it off
    pub system_info_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConsoleConfig {
    pub log_capacity: Option<usize>,
    pub log_dir: Option<String>,
}

impl StationConfig {
    pub fn team_number(&self) -> u32 {
        self.team_number.unwrap_or(0)
    }

    pub fn alliance(&self) -> Result<Alliance> {
        match &self.alliance {
            Some(name) => name.parse().map_err(DsError::Config),
            None => Ok(Alliance::default()),
        }
    }

    pub fn game_data(&self) -> &str {
        self.game_data.as_deref().unwrap_or("")
    }
}

impl NetworkConfig {
    pub fn control_port(&self) -> u16 {
        self.control_port.unwrap_or(CONTROL_PORT)
    }

    pub fn status_port(&self) -> u16 {
        self.status_port.unwrap_or(STATUS_PORT)
    }

    pub fn console_port(&self) -> u16 {
        self.console_port.unwrap_or(CONSOLE_PORT)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms.unwrap_or(2000))
    }

    pub fn robot_address(&self) -> Result<Option<std::net::IpAddr>> {
        self.robot_address
            .as_deref()
            .map(|addr| {
                addr.parse()
                    .map_err(|e| DsError::Config(format!("Invalid robot_address '{}': {}", addr, e)))
            })
            .transpose()
    }
}

impl TimingConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms.unwrap_or(20))
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms.unwrap_or(250))
    }

    pub fn input_poll_period(&self) -> Duration {
        Duration::from_millis(self.input_poll_ms.unwrap_or(20))
    }

    pub fn publish_rate_hz(&self) -> u32 {
        self.publish_rate_hz.unwrap_or(10)
    }

    pub fn system_info_period(&self) -> Option<Duration> {
        match self.system_info_ms.unwrap_or(1000) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl ConsoleConfig {
    pub fn log_capacity(&self) -> usize {
        self.log_capacity.unwrap_or(crate::events::DEFAULT_LOG_CAPACITY)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log_dir.as_ref().map(PathBuf::from)
    }
}

impl DaemonConfig {
    pub fn load_from_path(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| DsError::Config(format!("Failed to read {}: {}", path, e)))?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to an empty map
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: DaemonConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject timings that cannot keep a robot safely enabled
    pub fn validate(&self) -> Result<()> {
        let timing = self.timing();
        let tick = timing.tick_period();
        if tick.is_zero() {
            return Err(DsError::Config("tick_period_ms must be positive".to_string()));
        }
        if timing.watchdog_timeout() < tick * 2 {
            return Err(DsError::Config(format!(
                "watchdog_timeout_ms ({}) must cover at least two ticks ({} ms)",
                timing.watchdog_timeout().as_millis(),
                tick.as_millis() * 2
            )));
        }
        if timing.publish_rate_hz() == 0 {
            return Err(DsError::Config("publish_rate_hz must be positive".to_string()));
        }
        self.station().alliance()?;
        self.network().robot_address()?;
        Ok(())
    }

    pub fn station(&self) -> StationConfig {
        self.station.clone().unwrap_or_default()
    }

    pub fn network(&self) -> NetworkConfig {
        self.network.clone().unwrap_or_default()
    }

    pub fn timing(&self) -> TimingConfig {
        self.timing.clone().unwrap_or_default()
    }

    pub fn console(&self) -> ConsoleConfig {
        self.console.clone().unwrap_or_default()
    }

    /// Override the team number from the command line
    pub fn set_team_number(&mut self, team: u32) {
        self.station.get_or_insert_with(StationConfig::default).team_number = Some(team);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = DaemonConfig::load_from_str("").unwrap();
        assert_eq!(config.station().team_number(), 0);
        assert_eq!(config.network().control_port(), CONTROL_PORT);
        assert_eq!(config.network().status_port(), STATUS_PORT);
        assert_eq!(config.network().console_port(), CONSOLE_PORT);
        assert_eq!(config.timing().tick_period(), Duration::from_millis(20));
        assert_eq!(config.timing().watchdog_timeout(), Duration::from_millis(250));
        assert_eq!(config.timing().system_info_period(), Some(Duration::from_secs(1)));
        assert!(config.console().log_dir().is_none());
    }

    #[test]
    fn test_system_info_can_be_turned_off() {
        let config = DaemonConfig::load_from_str("timing:\n  system_info_ms: 0\n").unwrap();
        assert_eq!(config.timing().system_info_period(), None);
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
station:
  team_number: 245
  alliance: blue2
timing:
  watchdog_timeout_ms: 500
console:
  log_dir: /tmp/ds-logs
"#;
        let config = DaemonConfig::load_from_str(yaml).unwrap();
        assert_eq!(config.station().team_number(), 245);
        assert_eq!(config.station().alliance().unwrap(), Alliance::Blue2);
        assert_eq!(config.timing().watchdog_timeout(), Duration::from_millis(500));
        assert_eq!(config.timing().tick_period(), Duration::from_millis(20));
        assert_eq!(config.console().log_dir(), Some(PathBuf::from("/tmp/ds-logs")));
    }

    #[test]
    fn test_rejects_watchdog_shorter_than_two_ticks() {
        let yaml = "timing:\n  tick_period_ms: 20\n  watchdog_timeout_ms: 30\n";
        assert!(matches!(DaemonConfig::load_from_str(yaml), Err(DsError::Config(_))));
    }

    #[test]
    fn test_rejects_unknown_alliance() {
        let yaml = "station:\n  alliance: green1\n";
        assert!(matches!(DaemonConfig::load_from_str(yaml), Err(DsError::Config(_))));
    }

    #[test]
    fn test_robot_address_override() {
        let yaml = "network:\n  robot_address: 192.168.1.50\n";
        let config = DaemonConfig::load_from_str(yaml).unwrap();
        assert_eq!(
            config.network().robot_address().unwrap(),
            Some("192.168.1.50".parse().unwrap())
        );
        assert!(DaemonConfig::load_from_str("network:\n  robot_address: nope\n").is_err());
    }

    #[test]
    fn test_team_override() {
        let mut config = DaemonConfig::default();
        config.set_team_number(1678);
        assert_eq!(config.station().team_number(), 1678);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            DaemonConfig::load_from_path("/nonexistent/dsd.yaml"),
            Err(DsError::Config(_))
        ));
    }
}
