//! Data models for relay storage.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::registry::{EndpointId, JobId, LogsStatus};

/// How the relay reaches an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointType {
    Docker,
    AgentOnDocker,
    EdgeAgentOnDocker,
    KubernetesLocal,
    AgentOnKubernetes,
    EdgeAgentOnKubernetes,
}

impl EndpointType {
    pub const fn as_i64(self) -> i64 {
        match self {
            Self::Docker => 1,
            Self::AgentOnDocker => 2,
            Self::EdgeAgentOnDocker => 4,
            Self::KubernetesLocal => 5,
            Self::AgentOnKubernetes => 6,
            Self::EdgeAgentOnKubernetes => 7,
        }
    }

    pub const fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Docker),
            2 => Some(Self::AgentOnDocker),
            4 => Some(Self::EdgeAgentOnDocker),
            5 => Some(Self::KubernetesLocal),
            6 => Some(Self::AgentOnKubernetes),
            7 => Some(Self::EdgeAgentOnKubernetes),
            _ => None,
        }
    }

    pub const fn is_edge(self) -> bool {
        matches!(self, Self::EdgeAgentOnDocker | Self::EdgeAgentOnKubernetes)
    }

    pub const fn is_kubernetes(self) -> bool {
        matches!(
            self,
            Self::KubernetesLocal | Self::AgentOnKubernetes | Self::EdgeAgentOnKubernetes
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    /// Stored form of [`EndpointType`]; see [`Endpoint::kind`].
    pub endpoint_type: i64,
    pub url: String,
    pub edge_key: String,
    /// Agent identifier, recorded on first check-in.
    pub edge_id: Option<String>,
    /// Zero means "use the relay default".
    pub checkin_interval_secs: i64,
    pub last_checkin_at: Option<i64>,
    pub created_at: i64,
}

impl Endpoint {
    pub const fn kind(&self) -> Option<EndpointType> {
        EndpointType::from_i64(self.endpoint_type)
    }
}

/// Log metadata of one endpoint within an [`EdgeJob`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEndpointMeta {
    pub logs_status: LogsStatus,
    pub collect_logs: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeJob {
    pub id: JobId,
    pub name: String,
    pub cron_expression: String,
    pub recurring: bool,
    /// Script location inside the file store.
    pub script_path: String,
    pub version: i64,
    pub endpoints: BTreeMap<EndpointId, JobEndpointMeta>,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct EdgeJobRow {
    pub id: JobId,
    pub name: String,
    pub cron_expression: String,
    pub recurring: bool,
    pub script_path: String,
    pub version: i64,
    pub endpoints: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TeamMembership {
    pub user_id: i64,
    pub team_id: i64,
    pub role: String,
}
