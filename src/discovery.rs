//! Robot address resolution
//!
//! Team `T` maps to `10.(T/100).(T%100).x`; the controller is `.2` and the
//! radio `.1`. Team 0 means a simulator on this machine. Name resolution is
//! tried first and bounded by a timeout; the static address is the fallback.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest identifier that still fits the addressing scheme
pub const MAX_TEAM_NUMBER: u32 = 25599;

/// Second and third octets for a team number
pub fn team_octets(team: u32) -> (u8, u8) {
    let team = team.min(MAX_TEAM_NUMBER);
    ((team / 100) as u8, (team % 100) as u8)
}

pub fn static_address(team: u32) -> IpAddr {
    host_address(team, 2)
}

pub fn radio_address(team: u32) -> IpAddr {
    host_address(team, 1)
}

fn host_address(team: u32, host: u8) -> IpAddr {
    if team == 0 {
        return IpAddr::V4(Ipv4Addr::LOCALHOST);
    }
    let (high, low) = team_octets(team);
    IpAddr::V4(Ipv4Addr::new(10, high, low, host))
}

pub fn robot_hostname(team: u32) -> String {
    format!("roborio-{}-frc.local", team)
}

/// Resolve the controller address for a team, never failing
pub async fn resolve(team: u32, limit: Duration) -> IpAddr {
    if team == 0 {
        return static_address(0);
    }

    match timeout(limit, lookup(team, limit)).await {
        Ok(Some(addr)) => {
            info!("Resolved {} to {}", robot_hostname(team), addr);
            addr
        }
        Ok(None) | Err(_) => {
            let fallback = static_address(team);
            info!("Name resolution for team {} failed, using static address {}", team, fallback);
            fallback
        }
    }
}

async fn lookup(team: u32, limit: Duration) -> Option<IpAddr> {
    #[cfg(feature = "mdns")]
    {
        if let Some(addr) = mdns::browse(team, limit / 2).await {
            return Some(addr);
        }
    }
    #[cfg(not(feature = "mdns"))]
    let _ = limit;
    system_lookup(team).await
}

async fn system_lookup(team: u32) -> Option<IpAddr> {
    lookup_ipv4(&robot_hostname(team)).await
}

/// First IPv4 address the system resolver returns for `host`
async fn lookup_ipv4(host: &str) -> Option<IpAddr> {
    match tokio::net::lookup_host((host, 0)).await {
        Ok(mut addrs) => addrs.find(|addr| addr.is_ipv4()).map(|addr| addr.ip()),
        Err(e) => {
            debug!("System lookup of {} failed: {}", host, e);
            None
        }
    }
}

#[cfg(feature = "mdns")]
mod mdns {
    use mdns_sd::{ServiceDaemon, ServiceEvent};
    use std::net::IpAddr;
    use std::time::{Duration, Instant};
    use tracing::{debug, warn};

    const SERVICE_TYPE: &str = "_ni._tcp.local.";

    /// Browse for the controller's service record for at most `limit`
    pub async fn browse(team: u32, limit: Duration) -> Option<IpAddr> {
        let daemon = match ServiceDaemon::new() {
            Ok(daemon) => daemon,
            Err(e) => {
                warn!("mDNS init failed: {}", e);
                return None;
            }
        };
        let receiver = match daemon.browse(SERVICE_TYPE) {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!("mDNS browse failed: {}", e);
                let _ = daemon.shutdown();
                return None;
            }
        };

        let wanted = format!("roborio-{}-frc", team);
        let deadline = Instant::now() + limit;
        let found = tokio::task::spawn_blocking(move || loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match receiver.recv_timeout(remaining) {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    if info.get_fullname().to_lowercase().contains(&wanted) {
                        let addr = info
                            .get_addresses()
                            .iter()
                            .find_map(|addr| addr.to_string().parse::<IpAddr>().ok());
                        if addr.is_some() {
                            return addr;
                        }
                    }
                }
                Ok(_) => continue,
                Err(_) => return None,
            }
        });

        let result = found.await.ok().flatten();
        let _ = daemon.shutdown();
        debug!("mDNS browse for team {} finished: {:?}", team, result);
        result
    }
}
