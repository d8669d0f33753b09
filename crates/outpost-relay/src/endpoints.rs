//! Endpoint enrollment and removal.

use std::sync::Arc;

use tracing::info;

use outpost_core::db::DatabaseError;
use outpost_proto::{EdgeKey, EdgeKeyError};

use crate::jobs::{EdgeJobDispatcher, JobError};
use crate::registry::{EndpointId, TunnelRegistry};
use crate::storage::{Endpoint, EndpointType, RelayDatabase};

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error(transparent)]
    EdgeKey(#[from] EdgeKeyError),

    #[error(transparent)]
    Jobs(#[from] JobError),
}

pub struct EndpointService {
    db: RelayDatabase,
    registry: TunnelRegistry,
    dispatcher: Arc<EdgeJobDispatcher>,
    /// Host and port agents dial, embedded in edge keys.
    public_host: String,
    tunnel_port: u16,
}

impl EndpointService {
    pub fn new(
        db: RelayDatabase,
        registry: TunnelRegistry,
        dispatcher: Arc<EdgeJobDispatcher>,
        public_host: impl Into<String>,
        tunnel_port: u16,
    ) -> Self {
        Self {
            db,
            registry,
            dispatcher,
            public_host: public_host.into(),
            tunnel_port,
        }
    }

    /// Create an endpoint. Edge endpoints also get an edge key and a tunnel
    /// entry.
    pub async fn enroll(
        &self,
        name: &str,
        kind: EndpointType,
        url: &str,
        checkin_interval_secs: i64,
    ) -> Result<Endpoint, EndpointError> {
        let mut endpoint = self
            .db
            .create_endpoint(name, kind, url, checkin_interval_secs)
            .await?;

        if kind.is_edge() {
            let key = match EdgeKey::new(&self.public_host, self.tunnel_port, endpoint.id).encode()
            {
                Ok(key) => key,
                Err(e) => {
                    self.db.delete_endpoint(endpoint.id).await?;
                    return Err(e.into());
                }
            };
            self.db.set_endpoint_edge_key(endpoint.id, &key).await?;
            self.registry.mark_idle(endpoint.id);
            endpoint.edge_key = key;
        }

        info!(endpoint_id = endpoint.id, name, kind = ?kind, "Endpoint enrolled");
        Ok(endpoint)
    }

    /// Delete the endpoint, its job assignments, and its tunnel entry.
    pub async fn delete(&self, endpoint: EndpointId) -> Result<(), EndpointError> {
        self.dispatcher.forget_endpoint(endpoint).await?;
        if !self.db.delete_endpoint(endpoint).await? {
            return Err(DatabaseError::NotFound(format!("Endpoint {endpoint}")).into());
        }
        self.registry.remove(endpoint);
        info!(endpoint_id = endpoint, "Endpoint deleted");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::jobs::FileStore;
    use crate::registry::TunnelStatus;

    async fn service(public_host: &str) -> (EndpointService, TunnelRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = RelayDatabase::open_in_memory().await.unwrap();
        let registry = TunnelRegistry::new();
        let dispatcher = Arc::new(EdgeJobDispatcher::new(
            registry.clone(),
            db.clone(),
            FileStore::new(dir.path()),
        ));
        let service = EndpointService::new(db, registry.clone(), dispatcher, public_host, 8000);
        (service, registry, dir)
    }

    #[tokio::test]
    async fn edge_enrollment_issues_decodable_key() {
        let (service, registry, _dir) = service("relay.example.com").await;
        let endpoint = service
            .enroll("edge-1", EndpointType::EdgeAgentOnDocker, "", 0)
            .await
            .unwrap();

        let key = EdgeKey::decode(&endpoint.edge_key).unwrap();
        assert_eq!(key, EdgeKey::new("relay.example.com", 8000, endpoint.id));
        assert_eq!(registry.status(endpoint.id), TunnelStatus::Idle);
    }

    #[tokio::test]
    async fn non_edge_enrollment_has_no_key() {
        let (service, _, _dir) = service("relay").await;
        let endpoint = service
            .enroll("local", EndpointType::Docker, "unix:///var/run/docker.sock", 0)
            .await
            .unwrap();
        assert!(endpoint.edge_key.is_empty());
    }

    #[tokio::test]
    async fn invalid_public_host_rolls_back() {
        let (service, _, _dir) = service("").await;
        let err = service
            .enroll("edge-1", EndpointType::EdgeAgentOnDocker, "", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, EndpointError::EdgeKey(_)));
        assert!(service.db.list_endpoints().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_tunnel_entry_and_assignments() {
        let (service, registry, _dir) = service("relay").await;
        let endpoint = service
            .enroll("edge-1", EndpointType::EdgeAgentOnDocker, "", 0)
            .await
            .unwrap();
        let job = service
            .dispatcher
            .create("j", "* * * * *", false, b"", &[endpoint.id])
            .await
            .unwrap();
        registry.require_tunnel(endpoint.id);

        service.delete(endpoint.id).await.unwrap();

        assert_eq!(registry.status(endpoint.id), TunnelStatus::Idle);
        assert!(registry.details(endpoint.id).jobs.is_empty());
        let stored = service.db.get_edge_job(job.id).await.unwrap();
        assert!(stored.endpoints.is_empty());
        assert!(service.delete(endpoint.id).await.is_err());
    }
}
