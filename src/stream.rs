//! Operator command stream
//!
//! Reads newline-delimited commands from stdin, applies them to the driver
//! station and answers each with one JSON line on stdout. Ctrl+C or SIGTERM
//! disables the robot before the stream returns.

use crate::{
    controller::DriverStation,
    gamepad::SlotView,
    json_output::{self, current_timestamp, StatusReport},
    types::{Alliance, Mode},
};
use anyhow::Result;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// One parsed operator command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Enable,
    Disable,
    EStop,
    SetMode(Mode),
    SetAlliance(Alliance),
    SetTeam(u32),
    /// Fixed robot address; None returns to the configured or discovered one
    SetTarget(Option<IpAddr>),
    SetGameData(String),
    RebootRio,
    RestartCode,
    Reorder { from: usize, to: usize },
    Lock(usize),
    Unlock(usize),
    ListGamepads,
    Status,
    Quit,
}

/// Result of applying a command
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Accepted,
    Refused(String),
    Failed(String),
    Status(StatusReport),
    Slots(Vec<SlotView>),
    Quit,
}

/// Parse one input line; the game data argument keeps its inner spaces
pub fn parse_command(line: &str) -> std::result::Result<Command, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let args: Vec<&str> = rest.split_whitespace().collect();

    let command = match word.to_ascii_lowercase().as_str() {
        "enable" => Command::Enable,
        "disable" => Command::Disable,
        "estop" => Command::EStop,
        "mode" => Command::SetMode(single_arg(&args, "mode")?.parse()?),
        "alliance" => Command::SetAlliance(single_arg(&args, "alliance")?.parse()?),
        "team" => Command::SetTeam(parse_number(single_arg(&args, "team")?)?),
        "target" => match single_arg(&args, "target")? {
            "auto" => Command::SetTarget(None),
            addr => Command::SetTarget(Some(
                addr.parse().map_err(|_| format!("Not an IP address: {}", addr))?,
            )),
        },
        "gamedata" => Command::SetGameData(rest.to_string()),
        "reboot" => Command::RebootRio,
        "restart" => Command::RestartCode,
        "reorder" => match args.as_slice() {
            [from, to] => Command::Reorder {
                from: parse_number(from)?,
                to: parse_number(to)?,
            },
            _ => return Err("usage: reorder <from> <to>".to_string()),
        },
        "lock" => Command::Lock(parse_number(single_arg(&args, "lock")?)?),
        "unlock" => Command::Unlock(parse_number(single_arg(&args, "unlock")?)?),
        "gamepads" => Command::ListGamepads,
        "status" => Command::Status,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("Unknown command: {}", other)),
    };
    Ok(command)
}

fn single_arg<'a>(args: &[&'a str], command: &str) -> std::result::Result<&'a str, String> {
    match args {
        [arg] => Ok(arg),
        _ => Err(format!("usage: {} <value>", command)),
    }
}

fn parse_number<T: std::str::FromStr>(text: &str) -> std::result::Result<T, String> {
    text.parse().map_err(|_| format!("Not a number: {}", text))
}

/// Apply a command to the station
pub async fn execute(station: &DriverStation, command: Command) -> CommandOutcome {
    fn refused(result: std::result::Result<(), crate::error::CommandRefused>) -> CommandOutcome {
        match result {
            Ok(()) => CommandOutcome::Accepted,
            Err(reason) => CommandOutcome::Refused(reason.to_string()),
        }
    }

    match command {
        Command::Enable => refused(station.enable()),
        Command::Disable => {
            station.disable();
            CommandOutcome::Accepted
        }
        Command::EStop => {
            station.estop();
            CommandOutcome::Accepted
        }
        Command::SetMode(mode) => refused(station.set_mode(mode)),
        Command::SetAlliance(alliance) => match station.set_alliance(alliance).await {
            Ok(()) => CommandOutcome::Accepted,
            Err(e) => CommandOutcome::Failed(e.to_string()),
        },
        Command::SetTeam(team) => match station.set_team_number(team).await {
            Ok(()) => CommandOutcome::Accepted,
            Err(e) => CommandOutcome::Failed(e.to_string()),
        },
        Command::SetTarget(target) => match station.set_target_address(target).await {
            Ok(()) => CommandOutcome::Accepted,
            Err(e) => CommandOutcome::Failed(e.to_string()),
        },
        Command::SetGameData(data) => {
            station.set_game_data(&data);
            CommandOutcome::Accepted
        }
        Command::RebootRio => {
            station.reboot_rio();
            CommandOutcome::Accepted
        }
        Command::RestartCode => {
            station.restart_code();
            CommandOutcome::Accepted
        }
        Command::Reorder { from, to } => refused(station.reorder_gamepads(from, to)),
        Command::Lock(slot) => refused(station.lock_slot(slot)),
        Command::Unlock(slot) => refused(station.unlock_slot(slot)),
        Command::ListGamepads => CommandOutcome::Slots(station.list_gamepads()),
        Command::Status => CommandOutcome::Status(status_report(station)),
        Command::Quit => CommandOutcome::Quit,
    }
}

pub fn status_report(station: &DriverStation) -> StatusReport {
    let command = station.command_state();
    StatusReport {
        timestamp: current_timestamp(),
        event_type: "status".to_string(),
        team_number: station.team_number(),
        state: station.safety_state(),
        mode: command.mode,
        alliance: command.alliance,
        game_data: station.game_data(),
        robot: station.robot_state(),
        connection: station.connection(),
        target_address: station.target_address().map(|addr| addr.to_string()),
        system: station.system_info(),
    }
}

/// Stdin reader driving a shared station
pub struct CommandStream {
    station: Arc<DriverStation>,
    eof_logged: bool,
}

impl CommandStream {
    pub fn new(station: Arc<DriverStation>) -> Self {
        Self {
            station,
            eof_logged: false,
        }
    }

    /// Process commands until `quit`, a read error, or a shutdown signal
    pub async fn run(&mut self) -> Result<()> {
        info!("Command stream active; type 'status' for a snapshot, Ctrl+C to stop");

        let stdin = io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut buffer = String::new();

        let shutdown = setup_shutdown_handler();
        tokio::pin!(shutdown);

        loop {
            buffer.clear();

            tokio::select! {
                line_result = reader.read_line(&mut buffer) => {
                    match line_result {
                        Ok(0) => {
                            // Keep running without stdin; only a signal stops us now
                            if !self.eof_logged {
                                info!("End of input reached, waiting for shutdown signal");
                                self.eof_logged = true;
                            }
                            sleep(Duration::from_millis(100)).await;
                        }
                        Ok(_) => {
                            self.eof_logged = false;
                            let line = buffer.trim();
                            if line.is_empty() || line.starts_with('#') {
                                continue;
                            }
                            if !self.handle_line(line).await {
                                break;
                            }
                        }
                        Err(e) => {
                            error!("Failed to read from stdin: {}", e);
                            break;
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received, disabling robot");
                    self.station.disable();
                    break;
                }
            }
        }

        Ok(())
    }

    /// False when the stream should stop
    async fn handle_line(&mut self, line: &str) -> bool {
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(e) => {
                json_output::output::parse_error(&e);
                return true;
            }
        };

        match execute(&self.station, command).await {
            CommandOutcome::Accepted => json_output::output::command_accepted(line),
            CommandOutcome::Refused(reason) => {
                warn!("Command '{}' refused: {}", line, reason);
                json_output::output::command_refused(line, &reason);
            }
            CommandOutcome::Failed(e) => {
                error!("Command '{}' failed: {}", line, e);
                json_output::output::command_failed(line, &e);
            }
            CommandOutcome::Status(report) => json_output::output::status(report),
            CommandOutcome::Slots(slots) => json_output::output::slots(slots),
            CommandOutcome::Quit => {
                self.station.disable();
                return false;
            }
        }
        true
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn setup_shutdown_handler() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
