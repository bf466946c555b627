//! Status packet listener
//!
//! Every datagram on the status port is decoded; valid packets go to the
//! safety state machine (which feeds the watchdog), malformed ones are
//! dropped and logged. The watchdog itself is checked on the transmit side,
//! so a silent socket still disables the robot on time.

use crate::codec::StatusPacket;
use crate::error::{DsError, Result};
use crate::network::Backoff;
use crate::safety::SafetyController;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Largest datagram we accept; real status packets are far smaller
const MAX_DATAGRAM: usize = 1500;

pub struct StatusReceiver {
    socket: UdpSocket,
    safety: Arc<SafetyController>,
    /// Only datagrams from this host are considered when set
    robot: Option<std::net::IpAddr>,
    dropped: u64,
}

impl StatusReceiver {
    pub async fn bind(addr: SocketAddr, safety: Arc<SafetyController>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| DsError::Connection(format!("Failed to bind status port {}: {}", addr, e)))?;
        Ok(Self {
            socket,
            safety,
            robot: None,
            dropped: 0,
        })
    }

    /// Keep trying to bind until it works or shutdown is requested
    pub async fn bind_with_retry(
        addr: SocketAddr,
        safety: Arc<SafetyController>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Self> {
        let mut backoff = Backoff::default();
        loop {
            match Self::bind(addr, safety.clone()).await {
                Ok(receiver) => return Some(receiver),
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("{}; retrying in {} ms", e, delay.as_millis());
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return None;
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn only_from(mut self, robot: std::net::IpAddr) -> Self {
        self.robot = Some(robot);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Decode and apply one datagram; false when it was dropped
    pub fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) -> bool {
        if let Some(robot) = self.robot {
            if !robot.is_loopback() && from.ip() != robot {
                trace!("Ignoring datagram from {}", from);
                return false;
            }
        }

        match StatusPacket::decode(data) {
            Ok(packet) => {
                trace!("Status packet {} from {}", packet.sequence, from);
                self.safety.apply_status(&packet, Instant::now());
                true
            }
            Err(e) => {
                self.dropped += 1;
                debug!("Dropped malformed status datagram from {} ({} bytes): {}", from, data.len(), e);
                false
            }
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        match self.socket.local_addr() {
            Ok(addr) => info!("Status receiver listening on {}", addr),
            Err(_) => info!("Status receiver listening"),
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        self.handle_datagram(&buf[..len], from);
                    }
                    Err(e) => {
                        warn!("Status socket error: {}", e);
                        self.safety.link_lost("status socket error");
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Status receiver stopped ({} malformed datagrams dropped)", self.dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StatusFlags;
    use crate::events::StationEvents;
    use crate::safety::{SafetyState, DEFAULT_WATCHDOG_TIMEOUT};
    use std::time::Duration;

    fn safety() -> Arc<SafetyController> {
        Arc::new(SafetyController::new(
            DEFAULT_WATCHDOG_TIMEOUT,
            Arc::new(StationEvents::default()),
        ))
    }

    fn from() -> SocketAddr {
        "127.0.0.1:1110".parse().unwrap()
    }

    #[tokio::test]
    async fn test_valid_packet_connects() {
        let safety = safety();
        let mut receiver = StatusReceiver::bind("127.0.0.1:0".parse().unwrap(), safety.clone())
            .await
            .unwrap();

        let packet = StatusPacket {
            sequence: 3,
            status: StatusFlags { code_running: true, ..Default::default() },
            battery_voltage: 12.5,
            ..Default::default()
        };
        assert!(receiver.handle_datagram(&packet.encode(), from()));
        assert_eq!(safety.state(), SafetyState::ConnectedDisabled);
        assert_eq!(safety.robot_state().sequence_number, 3);
    }

    #[tokio::test]
    async fn test_malformed_datagram_does_not_feed_watchdog() {
        let safety = safety();
        let mut receiver = StatusReceiver::bind("127.0.0.1:0".parse().unwrap(), safety.clone())
            .await
            .unwrap();

        assert!(!receiver.handle_datagram(&[0x00, 0x01, 0x01], from()));
        let mut bad_tag = StatusPacket::default().encode();
        bad_tag.extend_from_slice(&[6, 0x99, 0]);
        assert!(!receiver.handle_datagram(&bad_tag, from()));

        assert_eq!(safety.state(), SafetyState::Disconnected);
        assert_eq!(safety.enable(), Err(crate::error::CommandRefused::Disconnected));
    }

    #[tokio::test]
    async fn test_packet_with_unrecognized_tag_connects() {
        let safety = safety();
        let mut receiver = StatusReceiver::bind("127.0.0.1:0".parse().unwrap(), safety.clone())
            .await
            .unwrap();

        let mut data = StatusPacket { sequence: 11, ..Default::default() }.encode();
        data.extend_from_slice(&[9, 0x01, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(receiver.handle_datagram(&data, from()));
        assert_eq!(safety.state(), SafetyState::ConnectedDisabled);
        assert_eq!(safety.robot_state().sequence_number, 11);
    }

    #[tokio::test]
    async fn test_datagrams_from_other_hosts_ignored() {
        let safety = safety();
        let mut receiver = StatusReceiver::bind("127.0.0.1:0".parse().unwrap(), safety.clone())
            .await
            .unwrap()
            .only_from("10.2.45.2".parse().unwrap());

        let other: SocketAddr = "10.9.9.9:1110".parse().unwrap();
        assert!(!receiver.handle_datagram(&StatusPacket::default().encode(), other));
        assert_eq!(safety.state(), SafetyState::Disconnected);
    }

    #[tokio::test]
    async fn test_run_applies_datagrams_over_udp() {
        let safety = safety();
        let receiver = StatusReceiver::bind("127.0.0.1:0".parse().unwrap(), safety.clone())
            .await
            .unwrap();
        let addr = receiver.local_addr().unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(receiver.run(stop_rx));

        let robot = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        robot.send_to(&StatusPacket::default().encode(), addr).await.unwrap();

        let mut waited = 0;
        while safety.state() == SafetyState::Disconnected && waited < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(safety.state(), SafetyState::ConnectedDisabled);
    }

    #[tokio::test]
    async fn test_bind_retry_gives_up_on_shutdown() {
        let holder = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let taken = holder.local_addr().unwrap();

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let retry = tokio::spawn(async move {
            StatusReceiver::bind_with_retry(taken, safety(), &mut stop_rx).await.is_none()
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        assert!(retry.await.unwrap());
    }
}
