//! Telemetry abstraction
//!
//! Trait-based interface for publishing station events to any sink. The
//! daemon ships a stdout sink; anything else (a dashboard socket, a message
//! bus) only has to implement `TelemetryPublisher`.

use crate::types::{ConnectionStatus, DiagnosticData, LogEntry, RobotState};
use async_trait::async_trait;

/// Sink for station events
#[async_trait]
pub trait TelemetryPublisher: Send + Sync {
    async fn publish_robot_state(&self, data: &RobotState) -> anyhow::Result<()>;

    async fn publish_diagnostics(&self, data: &DiagnosticData) -> anyhow::Result<()>;

    async fn publish_connection(&self, data: &ConnectionStatus) -> anyhow::Result<()>;

    /// One console line from the robot
    async fn publish_log(&self, entry: &LogEntry) -> anyhow::Result<()>;

    /// Entities without a dedicated method (version, power, gamepads)
    async fn publish_custom(&self, topic: &str, data: &serde_json::Value) -> anyhow::Result<()> {
        let _ = (topic, data);
        Ok(())
    }
}

/// Discards everything
#[derive(Debug, Clone)]
pub struct NoOpTelemetry;

#[async_trait]
impl TelemetryPublisher for NoOpTelemetry {
    async fn publish_robot_state(&self, _data: &RobotState) -> anyhow::Result<()> {
        Ok(())
    }

    async fn publish_diagnostics(&self, _data: &DiagnosticData) -> anyhow::Result<()> {
        Ok(())
    }

    async fn publish_connection(&self, _data: &ConnectionStatus) -> anyhow::Result<()> {
        Ok(())
    }

    async fn publish_log(&self, _entry: &LogEntry) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Prints every event to stdout as `[TOPIC] {json}`
#[derive(Debug, Clone)]
pub struct ConsoleTelemetry {
    pub pretty_print: bool,
}

impl ConsoleTelemetry {
    pub fn new() -> Self {
        Self { pretty_print: false }
    }

    pub fn pretty() -> Self {
        Self { pretty_print: true }
    }

    fn format<T: serde::Serialize + ?Sized>(&self, topic: &str, data: &T) -> anyhow::Result<String> {
        let json = if self.pretty_print {
            serde_json::to_string_pretty(data)?
        } else {
            serde_json::to_string(data)?
        };
        Ok(format!("[{}] {}", topic, json))
    }
}

impl Default for ConsoleTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetryPublisher for ConsoleTelemetry {
    async fn publish_robot_state(&self, data: &RobotState) -> anyhow::Result<()> {
        println!("{}", self.format("STATE", data)?);
        Ok(())
    }

    async fn publish_diagnostics(&self, data: &DiagnosticData) -> anyhow::Result<()> {
        println!("{}", self.format("DIAGNOSTICS", data)?);
        Ok(())
    }

    async fn publish_connection(&self, data: &ConnectionStatus) -> anyhow::Result<()> {
        println!("{}", self.format("CONNECTION", data)?);
        Ok(())
    }

    async fn publish_log(&self, entry: &LogEntry) -> anyhow::Result<()> {
        println!("{}", self.format("LOG", entry)?);
        Ok(())
    }

    async fn publish_custom(&self, topic: &str, data: &serde_json::Value) -> anyhow::Result<()> {
        println!("{}", self.format(&topic.to_uppercase(), data)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_line_format() {
        let telemetry = ConsoleTelemetry::new();
        let line = telemetry
            .format("STATE", &RobotState { battery_voltage: 12.5, ..Default::default() })
            .unwrap();
        assert!(line.starts_with("[STATE] {"));
        assert!(line.contains(r#""battery_voltage":12.5"#));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_pretty_format_spans_lines() {
        let line = ConsoleTelemetry::pretty()
            .format("CONNECTION", &ConnectionStatus::default())
            .unwrap();
        assert!(line.contains('\n'));
    }

    #[tokio::test]
    async fn test_noop_accepts_everything() {
        let sink = NoOpTelemetry;
        sink.publish_robot_state(&RobotState::default()).await.unwrap();
        sink.publish_custom("power", &serde_json::json!({"x": 1})).await.unwrap();
    }
}
