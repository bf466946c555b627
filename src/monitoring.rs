//! Event forwarding with change detection and rate limiting
//!
//! `EventMonitor` subscribes to the event hub and forwards to a
//! `TelemetryPublisher`. Robot state, diagnostics and gamepads change on
//! every packet or poll, so they are published at most `pub_rate_hz` times a
//! second, always with the latest value. Everything else goes out as soon as
//! it changes.

use crate::events::StationEvents;
use crate::telemetry::TelemetryPublisher;
use crate::types::{DiagnosticData, GamepadInfo, RobotState};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Decides which high-frequency values are worth publishing
pub struct MonitorOutput {
    last_robot_state: Option<RobotState>,
    last_diagnostics: Option<DiagnosticData>,
    last_gamepads: Option<Vec<GamepadInfo>>,
    last_output: Option<Instant>,
    pub_rate_hz: u32,
    /// Ignore axis movement smaller than this
    axis_threshold: f32,
}

impl MonitorOutput {
    pub fn new(pub_rate_hz: u32) -> Self {
        Self {
            last_robot_state: None,
            last_diagnostics: None,
            last_gamepads: None,
            last_output: None,
            pub_rate_hz: pub_rate_hz.max(1),
            axis_threshold: 0.01,
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.pub_rate_hz as u64)
    }

    /// True once per interval
    pub fn rate_allows(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_output {
            if now.duration_since(last) < self.min_interval() {
                return false;
            }
        }
        self.last_output = Some(now);
        true
    }

    /// Sequence numbers change every packet and are not a state change
    pub fn should_output_robot_state(&mut self, state: &RobotState) -> bool {
        let comparable = RobotState { sequence_number: 0, ..state.clone() };
        if self.last_robot_state.as_ref() == Some(&comparable) {
            return false;
        }
        self.last_robot_state = Some(comparable);
        true
    }

    pub fn should_output_diagnostics(&mut self, diag: &DiagnosticData) -> bool {
        if self.last_diagnostics.as_ref() == Some(diag) {
            return false;
        }
        self.last_diagnostics = Some(diag.clone());
        true
    }

    pub fn should_output_gamepads(&mut self, gamepads: &[GamepadInfo]) -> bool {
        if let Some(last) = &self.last_gamepads {
            if !self.gamepads_changed(last, gamepads) {
                return false;
            }
        }
        self.last_gamepads = Some(gamepads.to_vec());
        true
    }

    fn gamepads_changed(&self, old: &[GamepadInfo], new: &[GamepadInfo]) -> bool {
        if old.len() != new.len() {
            return true;
        }
        old.iter().zip(new).any(|(a, b)| {
            a.id != b.id
                || a.slot != b.slot
                || a.locked != b.locked
                || a.buttons != b.buttons
                || a.povs != b.povs
                || a.axes.len() != b.axes.len()
                || a.axes.iter().zip(&b.axes).any(|(x, y)| (x - y).abs() > self.axis_threshold)
        })
    }
}

/// Forwards hub events to a publisher until shutdown
pub struct EventMonitor {
    events: Arc<StationEvents>,
    publisher: Arc<dyn TelemetryPublisher>,
    output: MonitorOutput,
}

impl EventMonitor {
    pub fn new(events: Arc<StationEvents>, publisher: Arc<dyn TelemetryPublisher>, pub_rate_hz: u32) -> Self {
        Self {
            events,
            publisher,
            output: MonitorOutput::new(pub_rate_hz),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Event monitor publishing at up to {} Hz", self.output.pub_rate_hz);

        let mut robot_state = self.events.subscribe_robot_state();
        let mut diagnostics = self.events.subscribe_diagnostics();
        let mut gamepads = self.events.subscribe_gamepads();
        let mut connection = self.events.subscribe_connection();
        let mut version = self.events.subscribe_version();
        let mut power = self.events.subscribe_power();
        let mut system_info = self.events.subscribe_system_info();
        let mut console = self.events.subscribe_console();

        let mut ticker = interval(self.output.min_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Initial values go out once
        self.publish_connection(&mut connection).await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.output.rate_allows(Instant::now()) {
                        self.flush_rate_limited(&mut robot_state, &mut diagnostics, &mut gamepads).await;
                    }
                }
                changed = connection.changed() => {
                    if changed.is_err() { break; }
                    self.publish_connection(&mut connection).await;
                }
                changed = version.changed() => {
                    if changed.is_err() { break; }
                    let value = version.borrow_and_update().clone();
                    self.publish_custom("version", &value).await;
                }
                changed = power.changed() => {
                    if changed.is_err() { break; }
                    let value = power.borrow_and_update().clone();
                    self.publish_custom("power", &value).await;
                }
                changed = system_info.changed() => {
                    if changed.is_err() { break; }
                    let value = system_info.borrow_and_update().clone();
                    self.publish_custom("system_info", &value).await;
                }
                received = console.recv() => match received {
                    Ok(entry) => {
                        if let Err(e) = self.publisher.publish_log(&entry).await {
                            debug!("Failed to publish log entry: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event monitor fell behind, {} log entries skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Event monitor stopped");
    }

    async fn flush_rate_limited(
        &mut self,
        robot_state: &mut watch::Receiver<RobotState>,
        diagnostics: &mut watch::Receiver<DiagnosticData>,
        gamepads: &mut watch::Receiver<Vec<GamepadInfo>>,
    ) {
        if robot_state.has_changed().unwrap_or(false) {
            let state = robot_state.borrow_and_update().clone();
            if self.output.should_output_robot_state(&state) {
                if let Err(e) = self.publisher.publish_robot_state(&state).await {
                    debug!("Failed to publish robot state: {}", e);
                }
            }
        }
        if diagnostics.has_changed().unwrap_or(false) {
            let diag = diagnostics.borrow_and_update().clone();
            if self.output.should_output_diagnostics(&diag) {
                if let Err(e) = self.publisher.publish_diagnostics(&diag).await {
                    debug!("Failed to publish diagnostics: {}", e);
                }
            }
        }
        if gamepads.has_changed().unwrap_or(false) {
            let pads = gamepads.borrow_and_update().clone();
            if self.output.should_output_gamepads(&pads) {
                self.publish_custom("gamepads", &pads).await;
            }
        }
    }

    async fn publish_connection(&self, connection: &mut watch::Receiver<crate::types::ConnectionStatus>) {
        let status = connection.borrow_and_update().clone();
        if let Err(e) = self.publisher.publish_connection(&status).await {
            debug!("Failed to publish connection status: {}", e);
        }
    }

    async fn publish_custom<T: serde::Serialize>(&self, topic: &str, data: &T) {
        match serde_json::to_value(data) {
            Ok(value) => {
                if let Err(e) = self.publisher.publish_custom(topic, &value).await {
                    debug!("Failed to publish {}: {}", topic, e);
                }
            }
            Err(e) => debug!("Failed to serialize {}: {}", topic, e),
        }
    }
}
