//! Upstream selection for requests addressed to an endpoint.

use std::sync::Arc;

use tracing::debug;

use outpost_kube::{CredentialError, CredentialProvisioner, UserId};

use crate::registry::{EndpointId, TunnelRegistry, TunnelStatus};
use crate::storage::{Endpoint, EndpointType};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The agent has been asked to connect; retry after its next check-in.
    #[error("Tunnel for endpoint {0} is not ready")]
    TunnelNotReady(EndpointId),

    #[error("Unsupported endpoint type {0}")]
    UnsupportedEndpoint(i64),

    #[error("Credential error: {0}")]
    Credentials(#[from] CredentialError),
}

/// How traffic reaches an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyStrategy {
    /// The relay talks to the endpoint URL itself.
    Direct { url: String },
    /// An agent listens at the URL and forwards for the relay.
    AgentProxy { url: String },
    /// The endpoint is only reachable through its reverse tunnel.
    EdgeProxy { endpoint_id: EndpointId },
}

impl ProxyStrategy {
    pub fn for_endpoint(endpoint: &Endpoint) -> Result<Self, ProxyError> {
        let kind = endpoint
            .kind()
            .ok_or(ProxyError::UnsupportedEndpoint(endpoint.endpoint_type))?;
        Ok(match kind {
            EndpointType::Docker | EndpointType::KubernetesLocal => Self::Direct {
                url: endpoint.url.clone(),
            },
            EndpointType::AgentOnDocker | EndpointType::AgentOnKubernetes => Self::AgentProxy {
                url: endpoint.url.clone(),
            },
            EndpointType::EdgeAgentOnDocker | EndpointType::EdgeAgentOnKubernetes => {
                Self::EdgeProxy {
                    endpoint_id: endpoint.id,
                }
            }
        })
    }

    /// Upstream address for the next request.
    ///
    /// For edge endpoints this records activity on an active tunnel, or
    /// requires one and reports [`ProxyError::TunnelNotReady`].
    pub fn resolve(&self, registry: &TunnelRegistry) -> Result<String, ProxyError> {
        match self {
            Self::Direct { url } | Self::AgentProxy { url } => Ok(url.clone()),
            Self::EdgeProxy { endpoint_id } => {
                let details = registry.details(*endpoint_id);
                if details.status == TunnelStatus::Active && registry.touch(*endpoint_id) {
                    return Ok(format!("127.0.0.1:{}", details.port));
                }
                registry.require_tunnel(*endpoint_id);
                debug!(endpoint_id, "Tunnel required for proxied request");
                Err(ProxyError::TunnelNotReady(*endpoint_id))
            }
        }
    }
}

/// Who a proxied request is made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester {
    Admin,
    User(UserId),
}

/// Resolved upstream plus the bearer token to present to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub upstream: String,
    pub bearer_token: Option<String>,
}

pub struct ProxyResolver {
    registry: TunnelRegistry,
    credentials: Option<Arc<CredentialProvisioner>>,
}

impl ProxyResolver {
    pub const fn new(
        registry: TunnelRegistry,
        credentials: Option<Arc<CredentialProvisioner>>,
    ) -> Self {
        Self {
            registry,
            credentials,
        }
    }

    /// Kubernetes endpoints get a bearer token for `requester` when a
    /// credential provisioner is configured.
    pub async fn resolve(
        &self,
        endpoint: &Endpoint,
        requester: Requester,
    ) -> Result<ProxyTarget, ProxyError> {
        let upstream = ProxyStrategy::for_endpoint(endpoint)?.resolve(&self.registry)?;

        let bearer_token = match (&self.credentials, endpoint.kind()) {
            (Some(credentials), Some(kind)) if kind.is_kubernetes() => Some(match requester {
                Requester::Admin => credentials.admin_token()?.to_string(),
                Requester::User(user_id) => credentials.get_token(user_id).await?,
            }),
            _ => None,
        };

        Ok(ProxyTarget {
            upstream,
            bearer_token,
        })
    }
}
