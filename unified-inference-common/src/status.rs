//! Backend lifecycle and service status payloads.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ExecutionMode;

/// Lifecycle state of one model backend.
///
/// `Absent` is never stored; it is what a name that was never started reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Absent,
    Starting,
    RunningHealthy,
    RunningUnhealthy,
    Stopped,
}

impl LifecycleState {
    /// Whether a process (or adopted server) is believed to be serving.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            LifecycleState::RunningHealthy | LifecycleState::RunningUnhealthy
        )
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, LifecycleState::RunningHealthy)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Absent => write!(f, "absent"),
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::RunningHealthy => write!(f, "running_healthy"),
            LifecycleState::RunningUnhealthy => write!(f, "running_unhealthy"),
            LifecycleState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time view of a tracked backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStatusSnapshot {
    pub state: LifecycleState,
    pub is_running: bool,
    pub is_healthy: bool,
    #[serde(default)]
    pub pid: Option<u32>,
    pub url: String,
    /// Seconds since the backend became ready.
    #[serde(default)]
    pub uptime_secs: Option<f64>,
    #[serde(default)]
    pub last_request_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    /// Automatic restarts: confirmed crashes and replaced unhealthy backends.
    #[serde(default)]
    pub restarts: u32,
}

/// Response of `GET /v1/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub execution_mode: ExecutionMode,
    pub backends: BTreeMap<String, BackendStatusSnapshot>,
}

/// Response of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub execution_mode: ExecutionMode,
}
