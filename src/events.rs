//! Per-entity notification channels
//!
//! Each entity gets its own `watch` channel carrying the latest value, so any
//! number of consumers can observe it without polling shared globals. Console
//! output is the exception: it is append-only, so it goes out on a
//! `broadcast` channel and is also kept in a bounded ring for late joiners.

use crate::types::{
    ConnectionStatus, DiagnosticData, GamepadInfo, LogEntry, PowerData, RobotState, SystemInfo,
    VersionInfo,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::{broadcast, watch};

pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Channel capacity for live console subscribers; slow readers lag, never block
const CONSOLE_CHANNEL_CAPACITY: usize = 256;

pub struct StationEvents {
    robot_state: watch::Sender<RobotState>,
    diagnostics: watch::Sender<DiagnosticData>,
    connection: watch::Sender<ConnectionStatus>,
    version: watch::Sender<VersionInfo>,
    power: watch::Sender<PowerData>,
    gamepads: watch::Sender<Vec<GamepadInfo>>,
    system_info: watch::Sender<SystemInfo>,
    console: broadcast::Sender<LogEntry>,
    log_ring: Mutex<VecDeque<LogEntry>>,
    log_capacity: usize,
}

impl StationEvents {
    pub fn new(log_capacity: usize) -> Self {
        let (console, _) = broadcast::channel(CONSOLE_CHANNEL_CAPACITY);
        Self {
            robot_state: watch::channel(RobotState::default()).0,
            diagnostics: watch::channel(DiagnosticData::default()).0,
            connection: watch::channel(ConnectionStatus::default()).0,
            version: watch::channel(VersionInfo::default()).0,
            power: watch::channel(PowerData::default()).0,
            gamepads: watch::channel(Vec::new()).0,
            system_info: watch::channel(SystemInfo::default()).0,
            console,
            log_ring: Mutex::new(VecDeque::with_capacity(log_capacity.min(4096))),
            log_capacity: log_capacity.max(1),
        }
    }

    pub fn publish_robot_state(&self, state: &RobotState) {
        self.robot_state.send_if_modified(|current| replace_if_changed(current, state));
    }

    pub fn publish_diagnostics(&self, diag: &DiagnosticData) {
        self.diagnostics.send_if_modified(|current| replace_if_changed(current, diag));
    }

    /// Apply an in-place edit; each writer touches only the fields it owns
    pub fn update_connection(&self, edit: impl FnOnce(&mut ConnectionStatus)) {
        self.connection.send_if_modified(|current| {
            let before = current.clone();
            edit(current);
            *current != before
        });
    }

    pub fn publish_version(&self, info: &VersionInfo) {
        self.version.send_if_modified(|current| replace_if_changed(current, info));
    }

    pub fn publish_power(&self, power: &PowerData) {
        self.power.send_if_modified(|current| replace_if_changed(current, power));
    }

    pub fn publish_gamepads(&self, gamepads: Vec<GamepadInfo>) {
        self.gamepads.send_if_modified(|current| {
            if *current == gamepads {
                return false;
            }
            *current = gamepads;
            true
        });
    }

    pub fn publish_system_info(&self, info: &SystemInfo) {
        self.system_info.send_if_modified(|current| replace_if_changed(current, info));
    }

    /// Append a console line, dropping the oldest once the ring is full
    pub fn push_log(&self, entry: LogEntry) {
        {
            let mut ring = self.log_ring.lock();
            while ring.len() >= self.log_capacity {
                ring.pop_front();
            }
            ring.push_back(entry.clone());
        }
        // No live subscribers is fine; the ring still has it
        let _ = self.console.send(entry);
    }

    pub fn recent_logs(&self) -> Vec<LogEntry> {
        self.log_ring.lock().iter().cloned().collect()
    }

    pub fn robot_state(&self) -> RobotState {
        self.robot_state.borrow().clone()
    }

    pub fn diagnostics(&self) -> DiagnosticData {
        self.diagnostics.borrow().clone()
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.connection.borrow().clone()
    }

    pub fn version(&self) -> VersionInfo {
        self.version.borrow().clone()
    }

    pub fn power(&self) -> PowerData {
        self.power.borrow().clone()
    }

    pub fn gamepads(&self) -> Vec<GamepadInfo> {
        self.gamepads.borrow().clone()
    }

    pub fn system_info(&self) -> SystemInfo {
        self.system_info.borrow().clone()
    }

    pub fn subscribe_robot_state(&self) -> watch::Receiver<RobotState> {
        self.robot_state.subscribe()
    }

    pub fn subscribe_diagnostics(&self) -> watch::Receiver<DiagnosticData> {
        self.diagnostics.subscribe()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe()
    }

    pub fn subscribe_version(&self) -> watch::Receiver<VersionInfo> {
        self.version.subscribe()
    }

    pub fn subscribe_power(&self) -> watch::Receiver<PowerData> {
        self.power.subscribe()
    }

    pub fn subscribe_gamepads(&self) -> watch::Receiver<Vec<GamepadInfo>> {
        self.gamepads.subscribe()
    }

    pub fn subscribe_system_info(&self) -> watch::Receiver<SystemInfo> {
        self.system_info.subscribe()
    }

    pub fn subscribe_console(&self) -> broadcast::Receiver<LogEntry> {
        self.console.subscribe()
    }

    /// Back to defaults for a new robot; console history and host info are kept
    pub fn reset(&self) {
        self.publish_robot_state(&RobotState::default());
        self.publish_diagnostics(&DiagnosticData::default());
        self.publish_version(&VersionInfo::default());
        self.publish_power(&PowerData::default());
        self.update_connection(|status| *status = ConnectionStatus::default());
    }
}

impl Default for StationEvents {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

fn replace_if_changed<T: Clone + PartialEq>(current: &mut T, next: &T) -> bool {
    if current == next {
        return false;
    }
    *current = next.clone();
    true
}
