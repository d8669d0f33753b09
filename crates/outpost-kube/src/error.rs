//! Credential subsystem errors.

use crate::UserId;

/// Failure reported by a cluster authorization backend.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Cluster API error: {0}")]
    Api(String),

    #[error("Token not yet issued for {0}")]
    TokenNotReady(String),

    #[error("Invalid namespace access policy: {0}")]
    InvalidPolicy(String),
}

/// Failure reported by the team membership lookup.
#[derive(Debug, thiserror::Error)]
#[error("Membership lookup failed: {0}")]
pub struct MembershipError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// A cluster step failed. The cache is untouched so a later call retries
    /// the whole sequence.
    #[error("Provisioning failed for user {user_id} at {step}: {source}")]
    ProvisioningFailed {
        user_id: UserId,
        step: &'static str,
        #[source]
        source: ClusterError,
    },

    #[error("Provisioning failed for user {user_id}: {source}")]
    Membership {
        user_id: UserId,
        #[source]
        source: MembershipError,
    },

    #[error("Not found: {0}")]
    NotFound(String),
}
