//! Local link checks and reconnect pacing
//!
//! The link monitor fills the best-effort fields of `ConnectionStatus`
//! once a second. None of these feed the safety state machine; only status
//! packets do that.

use crate::events::StationEvents;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info};

pub const LINK_CHECK_PERIOD: Duration = Duration::from_secs(1);
pub const RADIO_CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const RADIO_PORT: u16 = 80;

/// Address prefix handed out by the controller's USB tether
const USB_PREFIX: [u8; 3] = [172, 22, 11];

/// Exponential retry delay
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, next: initial }
    }

    /// Delay to wait now; doubles the one after, up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(5))
    }
}

pub fn is_usb_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.octets()[..3] == USB_PREFIX,
        IpAddr::V6(_) => false,
    }
}

/// Wireless adapters by name: `en0` on laptops, `wlan*` / `wlp*` elsewhere
pub fn is_wireless_name(name: &str) -> bool {
    name == "en0" || name.starts_with("wlan") || name.starts_with("wlp")
}

/// What the local interfaces say about the station's links
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceSummary {
    /// Some non-loopback, non-USB IPv4 interface has an address
    pub enet_link: bool,
    /// First such address
    pub enet_ip: Option<IpAddr>,
    pub wifi: bool,
    pub usb: bool,
}

impl InterfaceSummary {
    /// Classify `(interface name, address)` pairs
    pub fn from_addresses<'a>(addresses: impl IntoIterator<Item = (&'a str, IpAddr)>) -> Self {
        let mut summary = Self::default();
        for (name, ip) in addresses {
            if ip.is_loopback() || !ip.is_ipv4() {
                continue;
            }
            if is_usb_address(ip) {
                summary.usb = true;
                continue;
            }
            summary.enet_link = true;
            summary.wifi |= is_wireless_name(name);
            summary.enet_ip.get_or_insert(ip);
        }
        summary
    }

    /// Current state of this machine's interfaces
    pub fn scan() -> Self {
        match if_addrs::get_if_addrs() {
            Ok(interfaces) => {
                Self::from_addresses(interfaces.iter().map(|iface| (iface.name.as_str(), iface.ip())))
            }
            Err(e) => {
                debug!("Interface scan failed: {}", e);
                Self::default()
            }
        }
    }
}

pub async fn tcp_reachable(addr: SocketAddr, connect_timeout: Duration) -> bool {
    matches!(timeout(connect_timeout, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

pub async fn radio_reachable(radio: IpAddr, connect_timeout: Duration) -> bool {
    tcp_reachable(SocketAddr::new(radio, RADIO_PORT), connect_timeout).await
}

/// Periodic best-effort link checks toward one robot
pub struct LinkMonitor {
    robot: IpAddr,
    radio: Option<IpAddr>,
    events: Arc<StationEvents>,
    period: Duration,
}

impl LinkMonitor {
    pub fn new(robot: IpAddr, radio: Option<IpAddr>, events: Arc<StationEvents>) -> Self {
        Self {
            robot,
            radio,
            events,
            period: LINK_CHECK_PERIOD,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// One round of checks
    pub async fn check(&self) {
        let interfaces = InterfaceSummary::scan();
        let radio = match self.radio {
            Some(radio) => radio_reachable(radio, RADIO_CONNECT_TIMEOUT).await,
            None => false,
        };
        let robot_ip = self.robot.to_string();

        self.events.update_connection(|status| {
            status.enet_link = interfaces.enet_link;
            status.enet_ip = interfaces.enet_ip.map(|ip| ip.to_string());
            status.wifi = interfaces.wifi;
            status.usb = interfaces.usb;
            status.radio = radio;
            status.robot_ip = Some(robot_ip);
        });
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Link monitor watching {} (radio {:?})", self.robot, self.radio);
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.check().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Link monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 5000, 5000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_usb_prefix() {
        assert!(is_usb_address("172.22.11.2".parse().unwrap()));
        assert!(!is_usb_address("10.2.45.5".parse().unwrap()));
        assert!(!is_usb_address("::1".parse().unwrap()));
    }

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    #[test]
    fn test_interface_classification() {
        let summary = InterfaceSummary::from_addresses([
            ("lo", ip("127.0.0.1")),
            ("usb0", ip("172.22.11.1")),
            ("eth0", ip("fe80::1")),
            ("eth0", ip("10.2.45.5")),
            ("wlp3s0", ip("192.168.1.20")),
        ]);
        assert!(summary.usb);
        assert!(summary.enet_link);
        assert!(summary.wifi);
        assert_eq!(summary.enet_ip, Some(ip("10.2.45.5")));
    }

    #[test]
    fn test_wired_only_and_loopback_only() {
        let wired = InterfaceSummary::from_addresses([("enp0s31f6", ip("10.2.45.5"))]);
        assert!(wired.enet_link);
        assert!(!wired.wifi);
        assert!(!wired.usb);

        let idle = InterfaceSummary::from_addresses([("lo", ip("127.0.0.1"))]);
        assert_eq!(idle, InterfaceSummary::default());

        // A USB tether alone is not an ethernet link
        let tethered = InterfaceSummary::from_addresses([("usb0", ip("172.22.11.1"))]);
        assert!(tethered.usb);
        assert!(!tethered.enet_link);
        assert_eq!(tethered.enet_ip, None);
    }

    #[test]
    fn test_wireless_names() {
        assert!(is_wireless_name("en0"));
        assert!(is_wireless_name("wlan0"));
        assert!(is_wireless_name("wlp2s0"));
        assert!(!is_wireless_name("en1"));
        assert!(!is_wireless_name("eth0"));
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(tcp_reachable(addr, Duration::from_millis(200)).await);

        drop(listener);
        assert!(!tcp_reachable(addr, Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn test_check_fills_robot_address() {
        let events = Arc::new(StationEvents::default());
        let monitor = LinkMonitor::new(ip("127.0.0.1"), None, events.clone());
        monitor.check().await;

        let status = events.connection();
        assert_eq!(status.robot_ip.as_deref(), Some("127.0.0.1"));
        assert!(!status.radio);
        assert_eq!(status.enet_ip.is_some(), status.enet_link);
    }
}
