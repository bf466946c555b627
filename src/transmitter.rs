//! Fixed-cadence control packet sender
//!
//! Every tick reads the safety snapshot, the joystick snapshot and the game
//! data, encodes one control packet and sends it. The tick is clock-driven:
//! a slow send delays the next tick but never shifts the schedule.

use crate::codec::{ControlPacket, DateTimeTag};
use crate::error::{DsError, Result};
use crate::game_data::GameData;
use crate::gamepad::InputAggregator;
use crate::safety::SafetyController;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(20);

/// Sequence numbers divisible by this carry the date/time tag
pub const DATE_TIME_INTERVAL: u16 = 50;

/// Wrapping 16-bit packet counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceCounter(u16);

impl SequenceCounter {
    pub fn new(start: u16) -> Self {
        Self(start)
    }

    pub fn current(self) -> u16 {
        self.0
    }

    pub fn advance(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }
}

/// Shared state the transmitter samples each tick
#[derive(Clone)]
pub struct ControlSources {
    pub safety: Arc<SafetyController>,
    pub inputs: Arc<InputAggregator>,
    pub game_data: Arc<GameData>,
}

impl ControlSources {
    /// Assemble the packet for one tick
    pub fn build_packet(&self, sequence: u16, now: Instant, wall_clock: DateTime<Utc>) -> ControlPacket {
        let snapshot = self.safety.control_snapshot(now);
        ControlPacket {
            sequence,
            control: snapshot.control,
            requests: snapshot.requests,
            alliance: snapshot.alliance,
            joysticks: self.inputs.snapshot(),
            game_data: self.game_data.get(),
            date_time: (sequence % DATE_TIME_INTERVAL == 0)
                .then(|| DateTimeTag::from_datetime(&wall_clock)),
        }
    }
}

pub struct ControlTransmitter {
    socket: UdpSocket,
    target: SocketAddr,
    sources: ControlSources,
    period: Duration,
    sequence: SequenceCounter,
    send_failing: bool,
}

impl ControlTransmitter {
    pub async fn bind(target: SocketAddr, sources: ControlSources, period: Duration) -> Result<Self> {
        let local: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| DsError::Connection(format!("Failed to bind control socket: {}", e)))?;

        Ok(Self {
            socket,
            target,
            sources,
            period,
            sequence: SequenceCounter::default(),
            send_failing: false,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Send until the shutdown flag flips to true or its sender goes away
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Control transmitter sending to {} every {} ms", self.target, self.period.as_millis());

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Control transmitter stopped at sequence {}", self.sequence.current());
    }

    async fn tick(&mut self) {
        let packet = self
            .sources
            .build_packet(self.sequence.current(), Instant::now(), Utc::now());
        let bytes = packet.encode();

        match self.socket.send_to(&bytes, self.target).await {
            Ok(_) => {
                if !packet.requests.is_empty() {
                    self.sources.safety.requests_sent(packet.requests);
                    debug!("One-shot requests sent in packet {}", packet.sequence);
                }
                if self.send_failing {
                    info!("Control packets flowing to {} again", self.target);
                    self.send_failing = false;
                }
                self.sequence.advance();
            }
            Err(e) => {
                if !self.send_failing {
                    warn!("Control send to {} failed: {}", self.target, e);
                    self.send_failing = true;
                }
                self.sources.safety.link_lost("control send failed");
            }
        }
    }
}
