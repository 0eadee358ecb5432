//! Connection health monitoring.
//!
//! A [`HealthMonitor`] periodically reads a single register through the shared
//! transport guard and keeps latency statistics. Consumers read the last
//! known state without triggering a probe.

use crate::protocol::BASE_INFO_REG_ADDR;
use crate::transport::Transport;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Weight of a new latency sample in the moving average.
const AVG_WEIGHT: f64 = 0.2;
const MAX_FAILURES: u32 = 3;
/// Latency in seconds above which the connection counts as unhealthy.
const MAX_LATENCY: f64 = 5.0;

/// Maps a latency in seconds to a quality in `[0, 1]`.
pub fn quality(latency: f64) -> f64 {
    (2.0 / (1.0 + latency)).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionHealth {
    /// Seconds
    pub last_latency: Option<f64>,
    /// Exponential moving average of the latency in seconds.
    pub avg_latency: Option<f64>,
    pub quality: f64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Local>>,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            last_latency: None,
            avg_latency: None,
            quality: 1.0,
            consecutive_failures: 0,
            last_success: None,
        }
    }
}

impl ConnectionHealth {
    pub fn record_success(&mut self, latency: Duration) {
        let latency = latency.as_secs_f64();
        self.last_latency = Some(latency);
        self.avg_latency = Some(match self.avg_latency {
            Some(avg) => avg * (1.0 - AVG_WEIGHT) + latency * AVG_WEIGHT,
            None => latency,
        });
        self.quality = quality(latency);
        self.consecutive_failures = 0;
        self.last_success = Some(Local::now());
    }

    /// Counts a failed probe; latency and quality keep their last values.
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    pub fn is_healthy(&self) -> bool {
        self.last_success.is_some()
            && self.consecutive_failures < MAX_FAILURES
            && self.last_latency.map_or(true, |latency| latency < MAX_LATENCY)
    }

    pub fn report(&self) -> HealthReport {
        let round3 = |value: f64| (value * 1000.0).round() / 1000.0;
        HealthReport {
            connection_quality: (self.quality * 1000.0).round() / 10.0,
            last_latency: self.last_latency.map(round3),
            avg_latency: self.avg_latency.map(round3),
            consecutive_failures: self.consecutive_failures,
            last_success: self.last_success.map(|time| time.to_rfc3339()),
            healthy: self.is_healthy(),
        }
    }
}

/// Point in time summary of the connection health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Percent
    pub connection_quality: f64,
    pub last_latency: Option<f64>,
    pub avg_latency: Option<f64>,
    pub consecutive_failures: u32,
    pub last_success: Option<String>,
    pub healthy: bool,
}

pub struct HealthMonitor<T> {
    transport: Arc<Mutex<T>>,
    state: std::sync::Mutex<ConnectionHealth>,
    interval: Duration,
}

impl<T: Transport + 'static> HealthMonitor<T> {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

    pub fn new(transport: Arc<Mutex<T>>, interval: Duration) -> Self {
        Self {
            transport,
            state: std::sync::Mutex::new(ConnectionHealth::default()),
            interval,
        }
    }

    /// Reads one register and records the outcome.
    ///
    /// Returns the latency of a successful read.
    pub async fn probe(&self) -> Option<Duration> {
        let mut transport = self.transport.lock().await;
        let start = Instant::now();
        let result = transport.read_holding_registers(BASE_INFO_REG_ADDR, 1).await;
        let latency = start.elapsed();
        drop(transport);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(_) => {
                state.record_success(latency);
                log::trace!("health probe latency {latency:?}");
                Some(latency)
            }
            Err(err) => {
                state.record_failure();
                log::debug!("Latency measurement failed: {err}");
                None
            }
        }
    }

    /// The last known health, never performs a probe.
    pub fn metrics(&self) -> ConnectionHealth {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Probes immediately and then every interval until the task is stopped.
    pub fn spawn(self: Arc<Self>) -> HealthTask {
        log::debug!("Connection health monitoring started");
        let handle = tokio::spawn(async move {
            loop {
                self.probe().await;
                tokio::time::sleep(self.interval).await;
            }
        });
        HealthTask { handle }
    }
}

/// Handle of a running health monitor.
pub struct HealthTask {
    handle: JoinHandle<()>,
}

impl HealthTask {
    /// Cancels the monitor, whether it is sleeping or probing.
    pub async fn stop(self) {
        self.handle.abort();
        match self.handle.await {
            Err(err) if !err.is_cancelled() => log::error!("health monitor task failed: {err}"),
            _ => log::debug!("Connection health monitoring stopped"),
        }
    }
}
