//! Collaborator contracts used by the credential provisioner.

use async_trait::async_trait;

use crate::error::{ClusterError, MembershipError};
use crate::{TeamId, UserId};

/// Namespace every user identity is granted, regardless of policies.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Cluster role every user identity is bound to.
pub const USER_CLUSTER_ROLE: &str = "outpost-cr-user";

/// Cluster role binding that holds every user identity.
pub const USER_CLUSTER_ROLE_BINDING: &str = "outpost-crb-user";

/// Name of the service account backing `user_id`.
pub fn user_identity_name(instance_id: &str, user_id: UserId) -> String {
    format!("outpost-sa-user-{instance_id}-{user_id}")
}

/// Name of the role binding granting edit access inside `namespace`.
pub fn namespace_binding_name(instance_id: &str, namespace: &str) -> String {
    format!("outpost-rb-{instance_id}-{namespace}")
}

/// Operations against the cluster's authorization objects.
///
/// Every `ensure_*` call is idempotent: "already exists" is success and
/// existing subject lists are extended, never duplicated.
#[async_trait]
pub trait ClusterAuthorizer: Send + Sync {
    /// Ensure cluster-wide prerequisites (the shared user role) exist.
    async fn ensure_base_role(&self) -> Result<(), ClusterError>;

    async fn ensure_identity(&self, identity: &str) -> Result<(), ClusterError>;

    /// Bind `identity` to the shared user cluster role.
    async fn ensure_cluster_binding(&self, identity: &str) -> Result<(), ClusterError>;

    /// Grant `identity` edit access inside `namespace`.
    async fn ensure_namespace_binding(
        &self,
        identity: &str,
        namespace: &str,
    ) -> Result<(), ClusterError>;

    /// Namespaces that `user_id` may access directly or through `teams`.
    async fn accessible_namespaces(
        &self,
        user_id: UserId,
        teams: &[TeamId],
    ) -> Result<Vec<String>, ClusterError>;

    async fn fetch_bearer_token(&self, identity: &str) -> Result<String, ClusterError>;
}

/// Team membership lookup.
#[async_trait]
pub trait TeamMemberships: Send + Sync {
    async fn memberships_for_user(&self, user_id: UserId) -> Result<Vec<TeamId>, MembershipError>;
}
