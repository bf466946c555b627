//! Driver station coordinator
//!
//! Owns the shared state (safety, inputs, game data, event hub) and the
//! transport tasks that move it over the wire. Readdressing stops every
//! transport, waits for them to finish, then binds a fresh set.

use crate::{
    config::DaemonConfig,
    console::ConsoleChannel,
    discovery,
    error::{CommandRefused, DsError, Result},
    events::StationEvents,
    game_data::GameData,
    gamepad::{self, InputAggregator, InputBackend, SlotView},
    network::LinkMonitor,
    receiver::StatusReceiver,
    safety::{CommandState, SafetyController, SafetyState},
    transmitter::{ControlSources, ControlTransmitter},
    types::{
        Alliance, ConnectionStatus, DiagnosticData, GamepadInfo, LogEntry, Mode, PowerData,
        RobotState, SystemInfo, VersionInfo,
    },
};
use anyhow::Context;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One generation of transport tasks, all bound to the same robot address
struct Transports {
    robot: IpAddr,
    status_addr: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Transports {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!("{} task ended abnormally: {}", name, e);
            }
        }
        debug!("Transports for {} stopped", self.robot);
    }
}

struct InputPoller {
    stop: Arc<AtomicBool>,
    handle: std::thread::JoinHandle<()>,
}

pub struct DriverStation {
    config: DaemonConfig,
    team_number: Mutex<u32>,
    /// Runtime robot address, ahead of config and discovery
    target_override: Mutex<Option<IpAddr>>,
    events: Arc<StationEvents>,
    safety: Arc<SafetyController>,
    inputs: Arc<InputAggregator>,
    game_data: Arc<GameData>,
    transports: tokio::sync::Mutex<Option<Transports>>,
    poller: Mutex<Option<InputPoller>>,
}

impl DriverStation {
    pub fn new(config: DaemonConfig) -> anyhow::Result<Self> {
        config.validate().context("Invalid driver station configuration")?;

        let station = config.station();
        let events = Arc::new(StationEvents::new(config.console().log_capacity()));
        let safety = Arc::new(SafetyController::new(
            config.timing().watchdog_timeout(),
            events.clone(),
        ));
        safety.set_alliance(station.alliance()?);

        let game_data = Arc::new(GameData::new());
        if !station.game_data().is_empty() {
            game_data.set(station.game_data());
        }

        Ok(Self {
            team_number: Mutex::new(station.team_number()),
            target_override: Mutex::new(None),
            inputs: Arc::new(InputAggregator::new(events.clone())),
            config,
            events,
            safety,
            game_data,
            transports: tokio::sync::Mutex::new(None),
            poller: Mutex::new(None),
        })
    }

    /// Start input polling with the best available backend and bring up the transports
    pub async fn start(&self) -> anyhow::Result<()> {
        self.start_with_backend(gamepad::default_backend).await
    }

    pub async fn start_with_backend<F>(&self, make_backend: F) -> anyhow::Result<()>
    where
        F: FnOnce() -> Box<dyn InputBackend> + Send + 'static,
    {
        info!("Starting driver station for team {}", self.team_number());
        self.start_poller(make_backend)
            .context("Failed to start input poller")?;
        self.rebuild().await.context("Failed to start transports")?;
        Ok(())
    }

    /// Stop every task and thread; the station can be started again afterwards
    pub async fn shutdown(&self) {
        info!("Shutting down driver station");
        if let Some(transports) = self.transports.lock().await.take() {
            transports.stop().await;
        }

        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            poller.stop.store(true, Ordering::Relaxed);
            let joined = tokio::task::spawn_blocking(move || poller.handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!("Input poller thread did not exit cleanly");
            }
        }
        self.safety.link_lost("driver station stopped");
    }

    fn start_poller<F>(&self, make_backend: F) -> std::io::Result<()>
    where
        F: FnOnce() -> Box<dyn InputBackend> + Send + 'static,
    {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let handle = gamepad::spawn_poller(
            self.inputs.clone(),
            make_backend,
            self.config.timing().input_poll_period(),
            stop.clone(),
        )?;
        *poller = Some(InputPoller { stop, handle });
        Ok(())
    }

    /// Tear down the current transports and bind new ones for the current team
    async fn rebuild(&self) -> Result<()> {
        let mut current = self.transports.lock().await;
        if let Some(old) = current.take() {
            old.stop().await;
        }
        self.safety.link_lost("transports rebuilding");

        let team = self.team_number();
        let network = self.config.network();
        let pinned = *self.target_override.lock();
        let fixed = match pinned {
            Some(addr) => Some(addr),
            None => network.robot_address()?,
        };
        let (robot, radio) = match fixed {
            Some(addr) => (addr, None),
            None => {
                let robot = discovery::resolve(team, network.discovery_timeout()).await;
                let radio = (team != 0).then(|| discovery::radio_address(team));
                (robot, radio)
            }
        };
        info!("Robot address for team {} is {}", team, robot);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let sources = ControlSources {
            safety: self.safety.clone(),
            inputs: self.inputs.clone(),
            game_data: self.game_data.clone(),
        };
        let transmitter = ControlTransmitter::bind(
            SocketAddr::new(robot, network.control_port()),
            sources,
            self.config.timing().tick_period(),
        )
        .await?;
        tasks.push(("transmitter", tokio::spawn(transmitter.run(shutdown_rx.clone()))));

        let status_bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), network.status_port());
        let status_addr = match StatusReceiver::bind(status_bind, self.safety.clone()).await {
            Ok(receiver) => {
                let addr = receiver.local_addr().ok();
                let receiver = receiver.only_from(robot);
                tasks.push(("receiver", tokio::spawn(receiver.run(shutdown_rx.clone()))));
                addr
            }
            Err(e) => {
                warn!("{}; retrying in the background", e);
                let safety = self.safety.clone();
                let mut retry_rx = shutdown_rx.clone();
                let task = tokio::spawn(async move {
                    if let Some(receiver) =
                        StatusReceiver::bind_with_retry(status_bind, safety, &mut retry_rx).await
                    {
                        receiver.only_from(robot).run(retry_rx).await;
                    }
                });
                tasks.push(("receiver", task));
                None
            }
        };

        let console = ConsoleChannel::new(
            SocketAddr::new(robot, network.console_port()),
            self.events.clone(),
        )?;
        tasks.push(("console", tokio::spawn(console.run(shutdown_rx.clone()))));

        let monitor = LinkMonitor::new(robot, radio, self.events.clone());
        tasks.push(("link monitor", tokio::spawn(monitor.run(shutdown_rx))));

        *current = Some(Transports {
            robot,
            status_addr,
            shutdown,
            tasks,
        });
        Ok(())
    }

    // Commands

    pub fn enable(&self) -> std::result::Result<(), CommandRefused> {
        self.safety.enable()
    }

    pub fn disable(&self) {
        self.safety.disable();
    }

    pub fn estop(&self) {
        self.safety.estop();
    }

    pub fn set_mode(&self, mode: Mode) -> std::result::Result<(), CommandRefused> {
        self.safety.set_mode(mode)
    }

    /// Change the station position and rebuild transports if they are running
    pub async fn set_alliance(&self, alliance: Alliance) -> Result<()> {
        if self.safety.command_state().alliance == alliance {
            return Ok(());
        }
        self.safety.set_alliance(alliance);
        self.rebuild_if_running().await
    }

    /// Switch to another robot; clears all per-robot state including the estop latch
    pub async fn set_team_number(&self, team: u32) -> Result<()> {
        if team > discovery::MAX_TEAM_NUMBER {
            return Err(DsError::Config(format!(
                "Team number {} exceeds {}",
                team,
                discovery::MAX_TEAM_NUMBER
            )));
        }
        {
            let mut current = self.team_number.lock();
            if *current == team {
                return Ok(());
            }
            info!("Team number changed from {} to {}", *current, team);
            *current = team;
        }
        if let Some(addr) = self.target_override.lock().take() {
            info!("Dropping robot address override {}", addr);
        }
        self.safety.reset();
        self.events.reset();
        self.rebuild_if_running().await
    }

    /// Talk to `target` instead of the configured or discovered robot
    ///
    /// `None` goes back to the configured address or discovery. A team
    /// number change also clears it.
    pub async fn set_target_address(&self, target: Option<IpAddr>) -> Result<()> {
        {
            let mut current = self.target_override.lock();
            if *current == target {
                return Ok(());
            }
            match target {
                Some(addr) => info!("Robot address set to {}", addr),
                None => info!("Robot address override cleared"),
            }
            *current = target;
        }
        self.rebuild_if_running().await
    }

    async fn rebuild_if_running(&self) -> Result<()> {
        let running = self.transports.lock().await.is_some();
        if running {
            self.rebuild().await?;
        }
        Ok(())
    }

    pub fn set_game_data(&self, data: &str) {
        self.game_data.set(data);
    }

    pub fn reboot_rio(&self) {
        self.safety.request_reboot();
    }

    pub fn restart_code(&self) {
        self.safety.request_restart_code();
    }

    pub fn reorder_gamepads(&self, from: usize, to: usize) -> std::result::Result<(), CommandRefused> {
        self.inputs.reorder(from, to)
    }

    pub fn lock_slot(&self, slot: usize) -> std::result::Result<(), CommandRefused> {
        self.inputs.lock_slot(slot)
    }

    pub fn unlock_slot(&self, slot: usize) -> std::result::Result<(), CommandRefused> {
        self.inputs.unlock_slot(slot)
    }

    pub fn list_gamepads(&self) -> Vec<SlotView> {
        self.inputs.list()
    }

    // Queries

    pub fn team_number(&self) -> u32 {
        *self.team_number.lock()
    }

    pub fn target_address(&self) -> Option<IpAddr> {
        *self.target_override.lock()
    }

    pub fn safety_state(&self) -> SafetyState {
        self.safety.state()
    }

    pub fn command_state(&self) -> CommandState {
        self.safety.command_state()
    }

    pub fn game_data(&self) -> String {
        self.game_data.get()
    }

    /// Address the status receiver is bound to, when it is bound
    pub async fn status_address(&self) -> Option<SocketAddr> {
        self.transports.lock().await.as_ref().and_then(|t| t.status_addr)
    }

    pub async fn robot_address(&self) -> Option<IpAddr> {
        self.transports.lock().await.as_ref().map(|t| t.robot)
    }

    pub fn robot_state(&self) -> RobotState {
        self.events.robot_state()
    }

    pub fn diagnostics(&self) -> DiagnosticData {
        self.events.diagnostics()
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.events.connection()
    }

    pub fn version(&self) -> VersionInfo {
        self.events.version()
    }

    pub fn power(&self) -> PowerData {
        self.events.power()
    }

    pub fn gamepads(&self) -> Vec<GamepadInfo> {
        self.events.gamepads()
    }

    pub fn recent_logs(&self) -> Vec<LogEntry> {
        self.events.recent_logs()
    }

    pub fn system_info(&self) -> SystemInfo {
        self.events.system_info()
    }

    pub fn events(&self) -> Arc<StationEvents> {
        self.events.clone()
    }

    pub fn subscribe_robot_state(&self) -> watch::Receiver<RobotState> {
        self.events.subscribe_robot_state()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.events.subscribe_connection()
    }

    pub fn subscribe_console(&self) -> broadcast::Receiver<LogEntry> {
        self.events.subscribe_console()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ControlPacket, StatusFlags, StatusPacket};
    use crate::gamepad::{InputEvent, ScriptedBackend};
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn local_config(control_port: u16) -> DaemonConfig {
        let yaml = format!(
            "network:\n  robot_address: 127.0.0.1\n  control_port: {}\n  status_port: 0\n  console_port: 9\n",
            control_port
        );
        DaemonConfig::load_from_str(&yaml).unwrap()
    }

    /// Answer every control packet with a status packet mirroring its control bits
    async fn fake_robot_reply(robot: &UdpSocket, status_addr: SocketAddr) -> ControlPacket {
        let mut buf = [0u8; 1500];
        let (len, _) = robot.recv_from(&mut buf).await.unwrap();
        let control = ControlPacket::decode(&buf[..len]).unwrap();
        let status = StatusPacket {
            sequence: control.sequence,
            status: StatusFlags {
                code_running: true,
                enabled: control.control.enabled,
                mode: control.control.mode,
                ..Default::default()
            },
            battery_voltage: 12.3,
            ..Default::default()
        };
        robot.send_to(&status.encode(), status_addr).await.unwrap();
        control
    }

    async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_enable_refused_before_robot_answers() {
        let ds = DriverStation::new(DaemonConfig::default()).unwrap();
        assert_eq!(ds.enable(), Err(CommandRefused::Disconnected));
        assert_eq!(ds.safety_state(), SafetyState::Disconnected);
    }

    #[tokio::test]
    async fn test_connects_and_enables_against_local_robot() {
        let robot = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ds = DriverStation::new(local_config(robot.local_addr().unwrap().port())).unwrap();
        ds.start_with_backend(|| Box::new(gamepad::NoInputBackend)).await.unwrap();

        let status_port = ds.status_address().await.unwrap().port();
        let status_addr: SocketAddr = ([127, 0, 0, 1], status_port).into();

        fake_robot_reply(&robot, status_addr).await;
        assert!(wait_for(|| ds.safety_state() == SafetyState::ConnectedDisabled).await);

        ds.enable().unwrap();
        let mut saw_enabled = false;
        for _ in 0..20 {
            if fake_robot_reply(&robot, status_addr).await.control.enabled {
                saw_enabled = true;
                break;
            }
        }
        assert!(saw_enabled);
        assert!(wait_for(|| ds.robot_state().enabled).await);

        // Robot goes quiet: the watchdog must drop the enabled bit
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(ds.safety_state(), SafetyState::Disconnected);
        let mut buf = [0u8; 1500];
        while robot.try_recv_from(&mut buf).is_ok() {}
        let (len, _) = robot.recv_from(&mut buf).await.unwrap();
        assert!(!ControlPacket::decode(&buf[..len]).unwrap().control.enabled);

        ds.shutdown().await;
    }

    #[tokio::test]
    async fn test_team_change_clears_estop_latch() {
        let ds = DriverStation::new(DaemonConfig::default()).unwrap();
        ds.estop();
        assert_eq!(ds.safety_state(), SafetyState::EStopped);

        ds.set_team_number(245).await.unwrap();
        assert_eq!(ds.team_number(), 245);
        assert_eq!(ds.safety_state(), SafetyState::Disconnected);
        assert!(!ds.command_state().estop_latched);
    }

    #[tokio::test]
    async fn test_target_address_redirects_control_stream() {
        let robot = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = robot.local_addr().unwrap().port();
        let other = UdpSocket::bind(("127.0.0.2", port)).await.unwrap();
        let ds = DriverStation::new(local_config(port)).unwrap();
        ds.start_with_backend(|| Box::new(gamepad::NoInputBackend)).await.unwrap();
        assert_eq!(ds.robot_address().await, Some("127.0.0.1".parse().unwrap()));

        let target: IpAddr = "127.0.0.2".parse().unwrap();
        ds.set_target_address(Some(target)).await.unwrap();
        assert_eq!(ds.target_address(), Some(target));
        assert_eq!(ds.robot_address().await, Some(target));

        let mut buf = [0u8; 1500];
        let received = tokio::time::timeout(Duration::from_secs(2), other.recv_from(&mut buf)).await;
        let (len, _) = received.unwrap().unwrap();
        assert!(ControlPacket::decode(&buf[..len]).is_ok());

        ds.set_target_address(None).await.unwrap();
        assert_eq!(ds.robot_address().await, Some("127.0.0.1".parse().unwrap()));

        ds.shutdown().await;
    }

    #[tokio::test]
    async fn test_team_change_clears_target_address() {
        let ds = DriverStation::new(DaemonConfig::default()).unwrap();
        ds.set_target_address(Some("10.0.0.9".parse().unwrap())).await.unwrap();
        assert!(ds.target_address().is_some());

        ds.set_team_number(245).await.unwrap();
        assert_eq!(ds.target_address(), None);
    }

    #[tokio::test]
    async fn test_team_number_out_of_range() {
        let ds = DriverStation::new(DaemonConfig::default()).unwrap();
        assert!(ds.set_team_number(99999).await.is_err());
        assert_eq!(ds.team_number(), 0);
    }

    #[tokio::test]
    async fn test_alliance_and_game_data_reach_the_wire() {
        let robot = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ds = DriverStation::new(local_config(robot.local_addr().unwrap().port())).unwrap();
        ds.start_with_backend(|| Box::new(gamepad::NoInputBackend)).await.unwrap();

        ds.set_alliance(Alliance::Blue3).await.unwrap();
        ds.set_game_data("LRL");
        ds.reboot_rio();

        let mut buf = [0u8; 1500];
        let mut seen = None;
        for _ in 0..50 {
            let (len, _) = robot.recv_from(&mut buf).await.unwrap();
            let packet = ControlPacket::decode(&buf[..len]).unwrap();
            if packet.requests.reboot {
                seen = Some(packet);
                break;
            }
        }
        let packet = seen.unwrap();
        assert_eq!(packet.alliance, Alliance::Blue3);
        assert_eq!(packet.game_data, "LRL");

        ds.shutdown().await;
    }

    #[tokio::test]
    async fn test_gamepad_commands_route_to_aggregator() {
        let backend = ScriptedBackend::new();
        backend.push(InputEvent::Connected { id: 7, name: "Pad".to_string() });

        let robot = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ds = DriverStation::new(local_config(robot.local_addr().unwrap().port())).unwrap();
        let scripted = backend.clone();
        ds.start_with_backend(move || Box::new(scripted)).await.unwrap();

        assert!(wait_for(|| ds.gamepads().len() == 1).await);
        ds.reorder_gamepads(0, 2).unwrap();
        ds.lock_slot(2).unwrap();

        let slots = ds.list_gamepads();
        assert_eq!(slots.len(), gamepad::SLOT_COUNT);
        assert_eq!(slots[2].locked_name.as_deref(), Some("Pad"));
        assert!(slots[0].device.is_none());
        assert_eq!(ds.lock_slot(9), Err(CommandRefused::InvalidSlot(9)));

        ds.shutdown().await;
    }
}
