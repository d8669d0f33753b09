//! Per-user cluster credentials.
//!
//! Lazily provisions one service account per application user against a
//! shared Kubernetes cluster, binds it to the namespaces the user may access
//! through direct or team grants, and caches the resulting bearer token.
//!
//! - [`TokenCache`]: user → token, no expiry
//! - [`CredentialProvisioner`]: single-flight provisioning in front of the cache
//! - [`KubeAuthorizer`]: the `kube`-backed [`ClusterAuthorizer`]

pub mod authorizer;
pub mod cache;
pub mod error;
pub mod kube_backend;
pub mod policy;
pub mod provisioner;

pub use authorizer::{ClusterAuthorizer, TeamMemberships};
pub use cache::TokenCache;
pub use error::{ClusterError, CredentialError, MembershipError};
pub use kube_backend::KubeAuthorizer;
pub use provisioner::CredentialProvisioner;

/// Application user identifier.
pub type UserId = i64;

/// Application team identifier.
pub type TeamId = i64;
