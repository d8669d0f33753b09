//! Per-endpoint tunnel state.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use outpost_proto::TunnelState;

/// Identifier of an endpoint record.
pub type EndpointId = i64;

/// Identifier of an edge job record.
pub type JobId = i64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    /// No tunnel expected.
    #[default]
    Idle,
    /// The agent must dial in with the minted credentials.
    Required,
    /// Tunnel established; proxied traffic may flow.
    Active,
}

impl TunnelStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Required => "required",
            Self::Active => "active",
        }
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TunnelStatus> for TunnelState {
    fn from(status: TunnelStatus) -> Self {
        match status {
            TunnelStatus::Idle => Self::Idle,
            TunnelStatus::Required => Self::Required,
            TunnelStatus::Active => Self::Active,
        }
    }
}

/// Log collection state of one job on one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogsStatus {
    #[default]
    Idle,
    Pending,
    Collected,
}

impl LogsStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Collected => "collected",
        }
    }
}

impl std::fmt::Display for LogsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job assigned to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointJob {
    pub job_id: JobId,
    pub logs_status: LogsStatus,
    pub collect_logs: bool,
}

/// Snapshot of an endpoint's tunnel entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelDetails {
    pub status: TunnelStatus,
    /// Loopback port of the reverse tunnel; 0 unless active.
    pub port: u16,
    pub last_activity: Option<SystemTime>,
    /// One-time secret; empty unless required.
    pub credentials: String,
    pub jobs: Vec<EndpointJob>,
}

#[derive(Debug, Default)]
pub(crate) struct TunnelEntry {
    pub(crate) status: TunnelStatus,
    pub(crate) port: u16,
    pub(crate) last_activity: Option<SystemTime>,
    pub(crate) credentials: String,
    pub(crate) jobs: Vec<EndpointJob>,
}

impl TunnelEntry {
    pub(crate) fn reset(&mut self) {
        self.status = TunnelStatus::Idle;
        self.port = 0;
        self.credentials.clear();
    }

    pub(crate) fn snapshot(&self) -> TunnelDetails {
        TunnelDetails {
            status: self.status,
            port: self.port,
            last_activity: self.last_activity,
            credentials: self.credentials.clone(),
            jobs: self.jobs.clone(),
        }
    }
}
