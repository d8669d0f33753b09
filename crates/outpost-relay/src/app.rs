//! Wiring of the relay's components from configuration.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use outpost_core::Config;
use outpost_core::config::default_data_dir;
use outpost_kube::{CredentialProvisioner, KubeAuthorizer};

use crate::endpoints::EndpointService;
use crate::jobs::{EdgeJobDispatcher, FileStore};
use crate::proxy::ProxyResolver;
use crate::registry::TunnelRegistry;
use crate::storage::RelayDatabase;
use crate::tunnel::{TunnelServer, TunnelServerConfig};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Cannot determine data directory; set relay.data_dir")]
    NoDataDir,

    #[error("Storage error: {0}")]
    Storage(#[from] outpost_core::db::DatabaseError),

    #[error("Edge job restore failed: {0}")]
    Jobs(#[from] crate::jobs::JobError),

    #[error("Kubernetes setup failed: {0}")]
    Kube(#[from] outpost_kube::ClusterError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Every long-lived relay component, shared by the tunnel listener and the
/// management surface.
pub struct Relay {
    pub registry: TunnelRegistry,
    pub db: RelayDatabase,
    pub dispatcher: Arc<EdgeJobDispatcher>,
    pub endpoints: EndpointService,
    pub proxy: ProxyResolver,
    pub tunnel: Arc<TunnelServer>,
    pub listener: TcpListener,
}

impl Relay {
    pub async fn build(config: &Config) -> Result<Self, StartupError> {
        let data_dir = config
            .relay
            .data_dir
            .clone()
            .or_else(default_data_dir)
            .ok_or(StartupError::NoDataDir)?;
        let db_path: PathBuf = config
            .relay
            .database_path
            .clone()
            .unwrap_or_else(|| data_dir.join("relay.db"));

        info!(path = %db_path.display(), "Opening relay database");
        let db = RelayDatabase::open(&db_path).await?;

        let registry = TunnelRegistry::new();
        let dispatcher = Arc::new(EdgeJobDispatcher::new(
            registry.clone(),
            db.clone(),
            FileStore::new(&data_dir),
        ));
        dispatcher.restore().await?;

        let listener = TcpListener::bind(&config.relay.tunnel_addr).await?;
        let local = listener.local_addr()?;
        let public_host = if config.relay.public_host.is_empty() {
            local.ip().to_string()
        } else {
            config.relay.public_host.clone()
        };

        let endpoints = EndpointService::new(
            db.clone(),
            registry.clone(),
            Arc::clone(&dispatcher),
            public_host,
            local.port(),
        );

        let credentials = if config.kube.enabled {
            Some(Arc::new(Self::credentials(config, &db).await?))
        } else {
            None
        };
        let proxy = ProxyResolver::new(registry.clone(), credentials);

        let tunnel = Arc::new(TunnelServer::new(
            registry.clone(),
            db.clone(),
            Arc::clone(&dispatcher),
            TunnelServerConfig::from(&config.relay),
        ));

        Ok(Self {
            registry,
            db,
            dispatcher,
            endpoints,
            proxy,
            tunnel,
            listener,
        })
    }

    async fn credentials(
        config: &Config,
        db: &RelayDatabase,
    ) -> Result<CredentialProvisioner, StartupError> {
        let kube = &config.kube;
        let authorizer = KubeAuthorizer::try_default(&kube.namespace, &kube.instance_id).await?;
        let mut provisioner =
            CredentialProvisioner::new(Arc::new(authorizer), Arc::new(db.clone()), &kube.instance_id);

        if let Some(path) = &kube.admin_token_path {
            let token = tokio::fs::read_to_string(path).await?;
            provisioner = provisioner.with_admin_token(token.trim());
        }
        info!(
            instance_id = %kube.instance_id,
            namespace = %kube.namespace,
            "Kubernetes credentials enabled"
        );
        Ok(provisioner)
    }
}
