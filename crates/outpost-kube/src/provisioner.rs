//! Single-flight provisioning of per-user cluster credentials.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::authorizer::{DEFAULT_NAMESPACE, user_identity_name};
use crate::cache::TokenCache;
use crate::error::{ClusterError, CredentialError};
use crate::{ClusterAuthorizer, TeamMemberships, UserId};

/// Issues bearer tokens for application users.
///
/// Cache hits never touch the provisioning lock. Misses take it, re-check the
/// cache, then run the whole ensure sequence while holding it, so at most one
/// provisioning sequence is in flight per process. Every step re-checks
/// existence, which makes a retry after a partial failure converge.
pub struct CredentialProvisioner {
    cache: TokenCache,
    authorizer: Arc<dyn ClusterAuthorizer>,
    memberships: Arc<dyn TeamMemberships>,
    instance_id: String,
    provisioning: Mutex<()>,
    admin_token: Option<String>,
}

impl CredentialProvisioner {
    pub fn new(
        authorizer: Arc<dyn ClusterAuthorizer>,
        memberships: Arc<dyn TeamMemberships>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            cache: TokenCache::new(),
            authorizer,
            memberships,
            instance_id: instance_id.into(),
            provisioning: Mutex::new(()),
            admin_token: None,
        }
    }

    /// Attach the relay's own service account token, used for administrators.
    #[must_use]
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    pub fn admin_token(&self) -> Result<&str, CredentialError> {
        self.admin_token
            .as_deref()
            .ok_or_else(|| CredentialError::NotFound("admin service account token".into()))
    }

    /// Return the bearer token for `user_id`, provisioning on first use.
    #[instrument(skip(self))]
    pub async fn get_token(&self, user_id: UserId) -> Result<String, CredentialError> {
        if let Some(token) = self.cache.get(user_id) {
            return Ok(token);
        }

        let _guard = self.provisioning.lock().await;

        // Another caller may have finished while we waited for the lock.
        if let Some(token) = self.cache.get(user_id) {
            debug!(user_id, "Token provisioned by a concurrent caller");
            return Ok(token);
        }

        let token = self.provision(user_id).await?;
        self.cache.insert(user_id, token.clone());
        info!(user_id, "User credentials provisioned");
        Ok(token)
    }

    /// Forget the cached token for `user_id`; the next call provisions again.
    pub fn invalidate(&self, user_id: UserId) -> bool {
        self.cache.remove(user_id).is_some()
    }

    pub const fn cache(&self) -> &TokenCache {
        &self.cache
    }

    async fn provision(&self, user_id: UserId) -> Result<String, CredentialError> {
        let teams = self
            .memberships
            .memberships_for_user(user_id)
            .await
            .map_err(|source| CredentialError::Membership { user_id, source })?;

        let identity = user_identity_name(&self.instance_id, user_id);
        let failed = |step: &'static str| {
            move |source: ClusterError| {
                warn!(user_id, step, error = %source, "Provisioning step failed");
                CredentialError::ProvisioningFailed {
                    user_id,
                    step,
                    source,
                }
            }
        };

        self.authorizer
            .ensure_base_role()
            .await
            .map_err(failed("base role"))?;
        self.authorizer
            .ensure_identity(&identity)
            .await
            .map_err(failed("identity"))?;
        self.authorizer
            .ensure_cluster_binding(&identity)
            .await
            .map_err(failed("cluster binding"))?;

        let mut namespaces = self
            .authorizer
            .accessible_namespaces(user_id, &teams)
            .await
            .map_err(failed("namespace policies"))?;
        namespaces.push(DEFAULT_NAMESPACE.to_string());
        namespaces.sort();
        namespaces.dedup();

        for namespace in &namespaces {
            self.authorizer
                .ensure_namespace_binding(&identity, namespace)
                .await
                .map_err(failed("namespace binding"))?;
        }
        debug!(user_id, identity = %identity, namespaces = ?namespaces, "Namespace access ensured");

        self.authorizer
            .fetch_bearer_token(&identity)
            .await
            .map_err(failed("token"))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::MembershipError;
    use crate::{ClusterAuthorizer, TeamId, TeamMemberships};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory cluster: binding name → subjects.
    #[derive(Default)]
    struct FakeCluster {
        identities: std::sync::Mutex<Vec<String>>,
        bindings: std::sync::Mutex<BTreeMap<String, Vec<String>>>,
        policies: HashMap<TeamId, Vec<String>>,
        ensure_identity_calls: AtomicUsize,
        fetch_token_calls: AtomicUsize,
        fail_namespace_binding: AtomicBool,
    }

    impl FakeCluster {
        fn bind(&self, binding: String, identity: &str) {
            let mut bindings = self.bindings.lock().unwrap();
            let subjects = bindings.entry(binding).or_default();
            if !subjects.iter().any(|s| s == identity) {
                subjects.push(identity.to_string());
            }
        }

        fn subjects(&self) -> BTreeMap<String, Vec<String>> {
            self.bindings.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ClusterAuthorizer for FakeCluster {
        async fn ensure_base_role(&self) -> Result<(), ClusterError> {
            Ok(())
        }

        async fn ensure_identity(&self, identity: &str) -> Result<(), ClusterError> {
            self.ensure_identity_calls.fetch_add(1, Ordering::SeqCst);
            // Widen the race window for concurrent callers.
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut identities = self.identities.lock().unwrap();
            if !identities.iter().any(|i| i == identity) {
                identities.push(identity.to_string());
            }
            Ok(())
        }

        async fn ensure_cluster_binding(&self, identity: &str) -> Result<(), ClusterError> {
            self.bind("crb".into(), identity);
            Ok(())
        }

        async fn ensure_namespace_binding(
            &self,
            identity: &str,
            namespace: &str,
        ) -> Result<(), ClusterError> {
            if self.fail_namespace_binding.swap(false, Ordering::SeqCst) {
                return Err(ClusterError::Api("connection reset".into()));
            }
            self.bind(format!("rb-{namespace}"), identity);
            Ok(())
        }

        async fn accessible_namespaces(
            &self,
            _user_id: UserId,
            teams: &[TeamId],
        ) -> Result<Vec<String>, ClusterError> {
            Ok(teams
                .iter()
                .filter_map(|t| self.policies.get(t))
                .flatten()
                .cloned()
                .collect())
        }

        async fn fetch_bearer_token(&self, identity: &str) -> Result<String, ClusterError> {
            self.fetch_token_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("token-for-{identity}"))
        }
    }

    struct FixedTeams(HashMap<UserId, Vec<TeamId>>);

    #[async_trait]
    impl TeamMemberships for FixedTeams {
        async fn memberships_for_user(
            &self,
            user_id: UserId,
        ) -> Result<Vec<TeamId>, MembershipError> {
            Ok(self.0.get(&user_id).cloned().unwrap_or_default())
        }
    }

    struct BrokenTeams;

    #[async_trait]
    impl TeamMemberships for BrokenTeams {
        async fn memberships_for_user(&self, _: UserId) -> Result<Vec<TeamId>, MembershipError> {
            Err(MembershipError("database locked".into()))
        }
    }

    fn cluster() -> Arc<FakeCluster> {
        Arc::new(FakeCluster {
            policies: [(9, vec!["team-a".to_string()]), (10, vec!["team-b".to_string()])]
                .into_iter()
                .collect(),
            ..Default::default()
        })
    }

    fn teams() -> Arc<FixedTeams> {
        Arc::new(FixedTeams([(3, vec![9, 10]), (4, vec![9])].into_iter().collect()))
    }

    #[tokio::test]
    async fn provisions_identity_and_team_namespaces() {
        let cluster = cluster();
        let provisioner = CredentialProvisioner::new(cluster.clone(), teams(), "test");

        let token = provisioner.get_token(3).await.unwrap();
        assert_eq!(token, "token-for-outpost-sa-user-test-3");

        let subjects = cluster.subjects();
        let identity = "outpost-sa-user-test-3".to_string();
        assert_eq!(subjects["crb"], vec![identity.clone()]);
        assert_eq!(subjects["rb-default"], vec![identity.clone()]);
        assert_eq!(subjects["rb-team-a"], vec![identity.clone()]);
        assert_eq!(subjects["rb-team-b"], vec![identity]);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_provisioning() {
        let cluster = cluster();
        let provisioner = Arc::new(CredentialProvisioner::new(cluster.clone(), teams(), "test"));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let p = Arc::clone(&provisioner);
                tokio::spawn(async move { p.get_token(3).await.unwrap() })
            })
            .collect();

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap());
        }

        assert_eq!(cluster.ensure_identity_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cluster.fetch_token_calls.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == &tokens[0]));
    }

    #[tokio::test]
    async fn cache_hit_skips_cluster() {
        let cluster = cluster();
        let provisioner = CredentialProvisioner::new(cluster.clone(), teams(), "test");

        provisioner.get_token(4).await.unwrap();
        provisioner.get_token(4).await.unwrap();

        assert_eq!(cluster.ensure_identity_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reprovisioning_does_not_duplicate_subjects() {
        let cluster = cluster();
        let provisioner = CredentialProvisioner::new(cluster.clone(), teams(), "test");

        provisioner.get_token(3).await.unwrap();
        let before = cluster.subjects();

        assert!(provisioner.invalidate(3));
        provisioner.get_token(3).await.unwrap();

        assert_eq!(cluster.subjects(), before);
        assert_eq!(cluster.ensure_identity_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn users_share_bindings_without_clobbering() {
        let cluster = cluster();
        let provisioner = CredentialProvisioner::new(cluster.clone(), teams(), "test");

        provisioner.get_token(3).await.unwrap();
        provisioner.get_token(4).await.unwrap();

        let subjects = cluster.subjects();
        assert_eq!(subjects["rb-team-a"].len(), 2);
        assert_eq!(subjects["rb-team-b"].len(), 1);
        assert_eq!(subjects["crb"].len(), 2);
    }

    #[tokio::test]
    async fn partial_failure_leaves_cache_empty_and_retry_converges() {
        let cluster = cluster();
        cluster.fail_namespace_binding.store(true, Ordering::SeqCst);
        let provisioner = CredentialProvisioner::new(cluster.clone(), teams(), "test");

        let err = provisioner.get_token(3).await.unwrap_err();
        assert!(matches!(
            err,
            CredentialError::ProvisioningFailed {
                user_id: 3,
                step: "namespace binding",
                ..
            }
        ));
        assert!(provisioner.cache().is_empty());

        let token = provisioner.get_token(3).await.unwrap();
        assert_eq!(token, "token-for-outpost-sa-user-test-3");
        assert_eq!(cluster.identities.lock().unwrap().len(), 1);
        assert_eq!(cluster.subjects()["crb"].len(), 1);
    }

    #[tokio::test]
    async fn membership_failure_is_reported() {
        let provisioner = CredentialProvisioner::new(cluster(), Arc::new(BrokenTeams), "test");
        let err = provisioner.get_token(3).await.unwrap_err();
        assert!(matches!(err, CredentialError::Membership { user_id: 3, .. }));
        assert!(provisioner.cache().is_empty());
    }

    #[tokio::test]
    async fn admin_token_requires_configuration() {
        let provisioner = CredentialProvisioner::new(cluster(), teams(), "test");
        assert!(matches!(
            provisioner.admin_token(),
            Err(CredentialError::NotFound(_))
        ));

        let provisioner = provisioner.with_admin_token("admin-token");
        assert_eq!(provisioner.admin_token().unwrap(), "admin-token");
    }
}
