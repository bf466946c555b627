//! Connection & safety state machine
//!
//! Owns the commanded state (enable, mode, alliance, estop latch, one-shot
//! requests) and the robot state decoded from status packets. The
//! transmitter asks it for a snapshot every tick; the receiver feeds it every
//! valid status packet. Those two calls are the only coupling between the
//! send and receive loops.
//!
//! # Rules
//!
//! - Enabling needs a live link (a valid status packet inside the watchdog
//!   window) and no estop.
//! - Watchdog expiry clears the commanded enable. The operator has to enable
//!   again after the link comes back.
//! - Estop latches. It clears only when a link that was up while the latch
//!   was held is lost and re-established (the controller rebooted or
//!   reconnected) and the controller no longer reports estop, or when the
//!   state is reset for a new team. An estop raised with no link survives
//!   the first connection.
//! - Mode changes are refused while enabled.

use crate::codec::{ControlFlags, Requests, StatusPacket};
use crate::error::CommandRefused;
use crate::events::StationEvents;
use crate::types::{Alliance, DiagnosticData, Mode, RobotState};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_millis(250);

/// Receive-side link watchdog
#[derive(Debug, Clone)]
pub struct Watchdog {
    timeout: Duration,
    last_fed: Option<Instant>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, last_fed: None }
    }

    pub fn feed(&mut self, now: Instant) {
        self.last_fed = Some(now);
    }

    /// True while the last feed is no older than the timeout
    pub fn is_satisfied(&self, now: Instant) -> bool {
        self.last_fed
            .map(|fed| now.saturating_duration_since(fed) <= self.timeout)
            .unwrap_or(false)
    }

    pub fn time_since_feed(&self, now: Instant) -> Option<Duration> {
        self.last_fed.map(|fed| now.saturating_duration_since(fed))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn reset(&mut self) {
        self.last_fed = None;
    }
}

/// Conceptual station state, derived from the underlying flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SafetyState {
    Disconnected,
    ConnectedDisabled,
    ConnectedEnabled,
    EStopped,
}

/// Operator-commanded state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandState {
    pub enabled: bool,
    pub mode: Mode,
    pub alliance: Alliance,
    pub estop_latched: bool,
    pub requests: Requests,
}

/// Everything the next control packet needs from the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSnapshot {
    pub control: ControlFlags,
    pub requests: Requests,
    pub alliance: Alliance,
}

struct Inner {
    command: CommandState,
    robot: RobotState,
    diagnostics: DiagnosticData,
    watchdog: Watchdog,
    link_up: bool,
    /// The latch was held while the link was up
    estop_reached_link: bool,
}

impl Inner {
    fn new(watchdog_timeout: Duration) -> Self {
        Self {
            command: CommandState::default(),
            robot: RobotState::default(),
            diagnostics: DiagnosticData::default(),
            watchdog: Watchdog::new(watchdog_timeout),
            link_up: false,
            estop_reached_link: false,
        }
    }

    fn state(&self) -> SafetyState {
        if self.command.estop_latched {
            SafetyState::EStopped
        } else if !self.link_up {
            SafetyState::Disconnected
        } else if self.command.enabled {
            SafetyState::ConnectedEnabled
        } else {
            SafetyState::ConnectedDisabled
        }
    }

    fn drop_link(&mut self) {
        self.link_up = false;
        self.command.enabled = false;
        self.robot.connected = false;
        self.robot.enabled = false;
        self.robot.code_running = false;
        self.robot.battery_voltage = 0.0;
    }
}

/// Shared safety gate between the command surface and the transports
pub struct SafetyController {
    inner: Mutex<Inner>,
    events: Arc<StationEvents>,
}

impl SafetyController {
    pub fn new(watchdog_timeout: Duration, events: Arc<StationEvents>) -> Self {
        Self {
            inner: Mutex::new(Inner::new(watchdog_timeout)),
            events,
        }
    }

    pub fn state(&self) -> SafetyState {
        self.inner.lock().state()
    }

    pub fn command_state(&self) -> CommandState {
        self.inner.lock().command
    }

    pub fn robot_state(&self) -> RobotState {
        self.inner.lock().robot.clone()
    }

    pub fn diagnostics(&self) -> DiagnosticData {
        self.inner.lock().diagnostics.clone()
    }

    pub fn watchdog_timeout(&self) -> Duration {
        self.inner.lock().watchdog.timeout()
    }

    pub fn enable(&self) -> Result<(), CommandRefused> {
        self.enable_at(Instant::now())
    }

    pub fn enable_at(&self, now: Instant) -> Result<(), CommandRefused> {
        let mut inner = self.inner.lock();
        self.expire_locked(&mut inner, now);

        if inner.command.estop_latched {
            warn!("Enable refused: emergency stop latched");
            return Err(CommandRefused::EStopped);
        }
        if !inner.link_up {
            warn!("Enable refused: no robot link");
            return Err(CommandRefused::Disconnected);
        }
        if !inner.command.enabled {
            inner.command.enabled = true;
            info!("Robot enabled ({})", inner.command.mode);
        }
        Ok(())
    }

    /// Always accepted
    pub fn disable(&self) {
        let mut inner = self.inner.lock();
        if inner.command.enabled {
            info!("Robot disabled");
        }
        inner.command.enabled = false;
    }

    /// Always accepted; holds until the robot reconnects
    pub fn estop(&self) {
        let mut inner = self.inner.lock();
        if !inner.command.estop_latched {
            warn!("Emergency stop latched");
        }
        inner.command.estop_latched = true;
        inner.command.enabled = false;
        if inner.link_up {
            inner.estop_reached_link = true;
        }
        inner.robot.estopped = true;
        self.events.publish_robot_state(&inner.robot);
    }

    pub fn set_mode(&self, mode: Mode) -> Result<(), CommandRefused> {
        self.set_mode_at(mode, Instant::now())
    }

    pub fn set_mode_at(&self, mode: Mode, now: Instant) -> Result<(), CommandRefused> {
        let mut inner = self.inner.lock();
        self.expire_locked(&mut inner, now);

        if inner.command.enabled {
            warn!("Mode change to {} refused while enabled", mode);
            return Err(CommandRefused::Enabled);
        }
        inner.command.mode = mode;
        info!("Mode set to {}", mode);
        Ok(())
    }

    pub fn set_alliance(&self, alliance: Alliance) {
        self.inner.lock().command.alliance = alliance;
        info!("Alliance station set to {:?}", alliance);
    }

    pub fn request_reboot(&self) {
        self.inner.lock().command.requests.reboot = true;
        info!("Controller reboot requested");
    }

    pub fn request_restart_code(&self) {
        self.inner.lock().command.requests.restart_code = true;
        info!("Robot code restart requested");
    }

    /// Apply a decoded status packet and feed the watchdog
    ///
    /// Returns true when this packet re-established the link.
    pub fn apply_status(&self, packet: &StatusPacket, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        inner.watchdog.feed(now);

        let reconnected = !inner.link_up;
        if reconnected {
            inner.link_up = true;
            if inner.command.estop_latched && inner.estop_reached_link && !packet.status.estopped {
                inner.command.estop_latched = false;
                inner.estop_reached_link = false;
                info!("Robot link re-established, emergency stop cleared");
            } else {
                info!("Robot link established");
            }
        }

        if packet.status.estopped && !inner.command.estop_latched {
            warn!("Robot reports emergency stop");
            inner.command.estop_latched = true;
            inner.command.enabled = false;
        }
        if inner.command.estop_latched {
            inner.estop_reached_link = true;
        }

        let estop_latched = inner.command.estop_latched;
        let robot = &mut inner.robot;
        robot.connected = true;
        robot.code_running = packet.status.code_running;
        robot.enabled = packet.status.enabled;
        robot.estopped = estop_latched;
        robot.mode = packet.status.mode;
        robot.battery_voltage = packet.battery_voltage;
        robot.brownout = packet.status.brownout;
        robot.sequence_number = packet.sequence;

        packet.apply_diagnostics(&mut inner.diagnostics);

        self.events.publish_robot_state(&inner.robot);
        self.events.publish_diagnostics(&inner.diagnostics);
        let fms = packet.status.fms_attached;
        self.events.update_connection(|status| {
            status.robot = true;
            status.fms = fms;
        });

        reconnected
    }

    /// Force the link down if the watchdog window has passed
    ///
    /// Returns true when this call expired the link.
    pub fn expire_if_stale(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        self.expire_locked(&mut inner, now)
    }

    /// A transport failed outright; treat it like a lost link
    pub fn link_lost(&self, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.link_up {
            warn!("Robot link lost: {}", reason);
            inner.watchdog.reset();
            inner.drop_link();
            self.publish_link_down(&inner);
        }
    }

    /// Snapshot for the next outgoing packet
    ///
    /// The watchdog is checked first, so a stale link can never produce an
    /// enabled bit.
    pub fn control_snapshot(&self, now: Instant) -> ControlSnapshot {
        let mut inner = self.inner.lock();
        self.expire_locked(&mut inner, now);

        let enabled = inner.command.enabled
            && inner.link_up
            && !inner.command.estop_latched
            && inner.watchdog.is_satisfied(now);

        ControlSnapshot {
            control: ControlFlags {
                estop: inner.command.estop_latched,
                fms_attached: false,
                enabled,
                mode: inner.command.mode,
            },
            requests: inner.command.requests,
            alliance: inner.command.alliance,
        }
    }

    /// Clear one-shot requests that went out in a packet
    pub fn requests_sent(&self, sent: Requests) {
        let mut inner = self.inner.lock();
        let pending = &mut inner.command.requests;
        pending.reboot &= !sent.reboot;
        pending.restart_code &= !sent.restart_code;
    }

    /// Back to power-on defaults, keeping the configured alliance and timeout
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let alliance = inner.command.alliance;
        let timeout = inner.watchdog.timeout();
        *inner = Inner::new(timeout);
        inner.command.alliance = alliance;
        self.events.publish_robot_state(&inner.robot);
        self.events.publish_diagnostics(&inner.diagnostics);
        info!("Safety state reset");
    }

    fn expire_locked(&self, inner: &mut Inner, now: Instant) -> bool {
        if !inner.link_up || inner.watchdog.is_satisfied(now) {
            return false;
        }
        let silent_for = inner.watchdog.time_since_feed(now).unwrap_or_default();
        warn!(
            "Watchdog expired: no status packet for {} ms, forcing disable",
            silent_for.as_millis()
        );
        inner.drop_link();
        self.publish_link_down(inner);
        true
    }

    fn publish_link_down(&self, inner: &Inner) {
        self.events.publish_robot_state(&inner.robot);
        self.events.update_connection(|status| {
            status.robot = false;
            status.fms = false;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StatusFlags;

    const TIMEOUT: Duration = Duration::from_millis(250);

    fn controller() -> SafetyController {
        SafetyController::new(TIMEOUT, Arc::new(StationEvents::default()))
    }

    fn status(estopped: bool) -> StatusPacket {
        StatusPacket {
            sequence: 1,
            status: StatusFlags { estopped, code_running: true, ..Default::default() },
            battery_voltage: 12.3,
            ..Default::default()
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_enable_refused_while_disconnected() {
        let safety = controller();
        assert_eq!(safety.enable(), Err(CommandRefused::Disconnected));
        assert_eq!(safety.state(), SafetyState::Disconnected);
    }

    #[test]
    fn test_first_status_packet_connects_disabled() {
        let safety = controller();
        let t0 = Instant::now();
        assert!(safety.apply_status(&status(false), t0));
        assert!(!safety.apply_status(&status(false), t0 + ms(20)));

        assert_eq!(safety.state(), SafetyState::ConnectedDisabled);
        let robot = safety.robot_state();
        assert!(robot.connected && robot.code_running);
        assert!((robot.battery_voltage - 12.3).abs() < 1e-9);
    }

    #[test]
    fn test_watchdog_expiry_clears_enabled_bit_within_one_tick() {
        let safety = controller();
        let t0 = Instant::now();
        safety.apply_status(&status(false), t0);
        safety.enable_at(t0).unwrap();
        assert!(safety.control_snapshot(t0 + ms(20)).control.enabled);

        // Inside the window the bit stays set
        assert!(safety.control_snapshot(t0 + TIMEOUT).control.enabled);

        // First tick past the window
        let snapshot = safety.control_snapshot(t0 + TIMEOUT + ms(20));
        assert!(!snapshot.control.enabled);
        assert_eq!(safety.state(), SafetyState::Disconnected);
        assert!(!safety.robot_state().connected);
    }

    #[test]
    fn test_link_recovery_requires_fresh_enable() {
        let safety = controller();
        let t0 = Instant::now();
        safety.apply_status(&status(false), t0);
        safety.enable_at(t0).unwrap();
        assert!(safety.expire_if_stale(t0 + ms(400)));

        let t1 = t0 + ms(500);
        safety.apply_status(&status(false), t1);
        assert!(!safety.control_snapshot(t1).control.enabled);
        assert_eq!(safety.state(), SafetyState::ConnectedDisabled);

        safety.enable_at(t1).unwrap();
        assert!(safety.control_snapshot(t1 + ms(20)).control.enabled);
    }

    #[test]
    fn test_estop_is_sticky_until_reconnect() {
        let safety = controller();
        let t0 = Instant::now();
        safety.apply_status(&status(false), t0);
        safety.enable_at(t0).unwrap();
        safety.estop();

        for tick in 1..10u64 {
            let now = t0 + ms(tick * 20);
            safety.apply_status(&status(true), now);
            safety.disable();
            assert_eq!(safety.enable_at(now), Err(CommandRefused::EStopped));
            let snapshot = safety.control_snapshot(now);
            assert!(snapshot.control.estop);
            assert!(!snapshot.control.enabled);
        }
        assert_eq!(safety.state(), SafetyState::EStopped);

        // Link drops, robot reboots and comes back without estop
        let last = t0 + ms(180);
        assert!(safety.expire_if_stale(last + ms(300)));
        let back = last + ms(2000);
        safety.apply_status(&status(false), back);
        assert_eq!(safety.state(), SafetyState::ConnectedDisabled);
        assert!(safety.enable_at(back).is_ok());
    }

    #[test]
    fn test_estop_survives_reconnect_while_robot_still_reports_it() {
        let safety = controller();
        let t0 = Instant::now();
        safety.apply_status(&status(false), t0);
        safety.estop();
        safety.expire_if_stale(t0 + ms(300));

        safety.apply_status(&status(true), t0 + ms(400));
        assert_eq!(safety.state(), SafetyState::EStopped);
        assert!(safety.enable_at(t0 + ms(400)).is_err());
    }

    #[test]
    fn test_estop_while_disconnected_survives_first_connection() {
        let safety = controller();
        let t0 = Instant::now();
        safety.estop();

        safety.apply_status(&status(false), t0);
        assert_eq!(safety.state(), SafetyState::EStopped);
        assert_eq!(safety.enable_at(t0), Err(CommandRefused::EStopped));
        assert!(safety.control_snapshot(t0).control.estop);

        // Only a later loss and recovery of that link clears it
        assert!(safety.expire_if_stale(t0 + ms(300)));
        safety.apply_status(&status(false), t0 + ms(2000));
        assert_eq!(safety.state(), SafetyState::ConnectedDisabled);
    }

    #[test]
    fn test_robot_reported_estop_latches() {
        let safety = controller();
        let t0 = Instant::now();
        safety.apply_status(&status(false), t0);
        safety.enable_at(t0).unwrap();

        safety.apply_status(&status(true), t0 + ms(20));
        assert_eq!(safety.state(), SafetyState::EStopped);
        assert!(!safety.control_snapshot(t0 + ms(40)).control.enabled);
    }

    #[test]
    fn test_mode_change_refused_while_enabled() {
        let safety = controller();
        let t0 = Instant::now();
        safety.apply_status(&status(false), t0);
        safety.enable_at(t0).unwrap();

        assert_eq!(safety.set_mode_at(Mode::Autonomous, t0), Err(CommandRefused::Enabled));
        assert_eq!(safety.command_state().mode, Mode::Teleoperated);

        safety.disable();
        assert!(safety.set_mode_at(Mode::Autonomous, t0).is_ok());
        assert_eq!(safety.control_snapshot(t0).control.mode, Mode::Autonomous);
    }

    #[test]
    fn test_one_shot_requests_cleared_after_send() {
        let safety = controller();
        let t0 = Instant::now();
        safety.request_reboot();
        safety.request_restart_code();

        let snapshot = safety.control_snapshot(t0);
        assert!(snapshot.requests.reboot && snapshot.requests.restart_code);

        safety.requests_sent(snapshot.requests);
        assert!(safety.control_snapshot(t0).requests.is_empty());
    }

    #[test]
    fn test_request_raised_while_sending_is_kept() {
        let safety = controller();
        let t0 = Instant::now();
        safety.request_reboot();
        let snapshot = safety.control_snapshot(t0);

        safety.request_restart_code();
        safety.requests_sent(snapshot.requests);

        let pending = safety.control_snapshot(t0).requests;
        assert!(!pending.reboot);
        assert!(pending.restart_code);
    }

    #[test]
    fn test_transport_fault_drops_link() {
        let safety = controller();
        let t0 = Instant::now();
        safety.apply_status(&status(false), t0);
        safety.enable_at(t0).unwrap();

        safety.link_lost("socket closed");
        assert!(!safety.control_snapshot(t0).control.enabled);
        assert_eq!(safety.state(), SafetyState::Disconnected);
    }

    #[test]
    fn test_reset_keeps_alliance() {
        let safety = controller();
        safety.set_alliance(Alliance::Blue2);
        safety.estop();
        safety.reset();

        assert_eq!(safety.state(), SafetyState::Disconnected);
        assert_eq!(safety.command_state().alliance, Alliance::Blue2);
        assert!(!safety.command_state().estop_latched);
    }
}
