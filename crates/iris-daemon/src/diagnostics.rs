//! Status reporting for the daemon.

use iris_acquisition::DeviceRecord;
use iris_fieldbus::{ExchangeStats, FieldbusSession};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Health of the acquisition service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Network operational, exchanges without work-counter errors.
    Healthy,
    /// Network operational but exchanges failed or came back short.
    Degraded,
    /// Background loops stopped or network out of operation.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

impl HealthStatus {
    /// Classify from the session flags and the stats delta since the last report.
    pub fn classify(operational: bool, previous: &ExchangeStats, current: &ExchangeStats) -> Self {
        if !operational {
            Self::Unhealthy
        } else if current.failures > previous.failures || current.wkc_errors > previous.wkc_errors {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }
}

/// Point-in-time view of the daemon.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Health derived from the session.
    pub health: HealthStatus,
    /// Adapter in use.
    pub adapter: String,
    /// Whether OP was confirmed at startup.
    pub all_op_reached: bool,
    /// Exchange statistics.
    pub stats: ExchangeStats,
    /// Devices currently running a job.
    pub running_jobs: Vec<String>,
    /// Seconds since the daemon started.
    pub uptime_secs: u64,
}

/// Produces status snapshots, remembering the stats of the previous one.
#[derive(Debug)]
pub struct StatusReporter {
    started: Instant,
    last_stats: ExchangeStats,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter {
    /// Start the uptime clock.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            last_stats: ExchangeStats::default(),
        }
    }

    /// Uptime since creation.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Build a snapshot from the session and the device rows.
    pub fn snapshot(&mut self, session: &FieldbusSession, devices: &[DeviceRecord]) -> StatusSnapshot {
        let stats = session.stats();
        let health = HealthStatus::classify(session.is_operational(), &self.last_stats, &stats);
        self.last_stats = stats;

        StatusSnapshot {
            health,
            adapter: session.adapter().to_string(),
            all_op_reached: session.all_op_reached(),
            stats,
            running_jobs: devices
                .iter()
                .filter(|d| d.running)
                .map(|d| d.sn.clone())
                .collect(),
            uptime_secs: self.uptime().as_secs(),
        }
    }
}

/// Render a snapshot as a single JSON line.
pub fn format_status_json(snapshot: &StatusSnapshot) -> String {
    serde_json::to_string(snapshot).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
}
