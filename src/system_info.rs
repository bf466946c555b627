//! Host CPU and battery reporting
//!
//! Samples the machine the station runs on and publishes a `SystemInfo`
//! event once a period. CPU usage is measured between two refreshes, so the
//! first sample goes out one period after start.

use crate::events::StationEvents;
use crate::types::SystemInfo;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

pub const SYSTEM_INFO_PERIOD: Duration = Duration::from_secs(1);

pub fn average_usage(per_core: &[f32]) -> f32 {
    if per_core.is_empty() {
        return 0.0;
    }
    per_core.iter().sum::<f32>() / per_core.len() as f32
}

/// Charge of the first battery, and whether it is on external power
pub fn read_battery() -> (Option<f32>, bool) {
    let manager = match battery::Manager::new() {
        Ok(manager) => manager,
        Err(e) => {
            debug!("Battery manager unavailable: {}", e);
            return (None, false);
        }
    };
    let mut batteries = match manager.batteries() {
        Ok(batteries) => batteries,
        Err(e) => {
            debug!("Battery enumeration failed: {}", e);
            return (None, false);
        }
    };
    match batteries.next() {
        Some(Ok(found)) => {
            let percent = found.state_of_charge().get::<battery::units::ratio::percent>();
            let charging = matches!(found.state(), battery::State::Charging | battery::State::Full);
            (Some(percent), charging)
        }
        Some(Err(e)) => {
            debug!("Battery read failed: {}", e);
            (None, false)
        }
        None => (None, false),
    }
}

/// Periodic host sampler feeding the event hub
pub struct SystemMonitor {
    system: Arc<Mutex<System>>,
    events: Arc<StationEvents>,
    period: Duration,
}

impl SystemMonitor {
    pub fn new(events: Arc<StationEvents>) -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            system: Arc::new(Mutex::new(system)),
            events,
            period: SYSTEM_INFO_PERIOD,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// One blocking sample of CPU and battery
    pub fn sample(&self) -> SystemInfo {
        sample_host(&self.system)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Host telemetry every {} ms", self.period.as_millis());
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The immediate first tick would measure an empty window
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let system = self.system.clone();
                    // /proc and /sys reads stay off the runtime workers
                    match tokio::task::spawn_blocking(move || sample_host(&system)).await {
                        Ok(info) => self.events.publish_system_info(&info),
                        Err(e) => debug!("Host sample task failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Host telemetry stopped");
    }
}

fn sample_host(system: &Mutex<System>) -> SystemInfo {
    let cpu_usage = {
        let mut system = system.lock();
        system.refresh_cpu_usage();
        let per_core: Vec<f32> = system.cpus().iter().map(|cpu| cpu.cpu_usage()).collect();
        average_usage(&per_core)
    };
    let (battery_percent, charging) = read_battery();
    SystemInfo {
        cpu_usage,
        battery_percent,
        charging,
    }
}
