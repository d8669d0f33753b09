//! [`ClusterAuthorizer`] backed by the Kubernetes API.
//!
//! Objects are created with `get_opt` + `create`. A 409 on create means a
//! concurrent writer won; the object is re-read and merged instead.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, PostParams};
use tracing::{debug, info, instrument};

use crate::authorizer::{
    ClusterAuthorizer, USER_CLUSTER_ROLE, USER_CLUSTER_ROLE_BINDING, namespace_binding_name,
};
use crate::error::ClusterError;
use crate::policy::{POLICY_CONFIG_MAP, POLICY_KEY, namespaces_for};
use crate::{TeamId, UserId};

/// Built-in role granted inside each accessible namespace.
const NAMESPACE_ROLE: &str = "edit";

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
const SERVICE_ACCOUNT_KIND: &str = "ServiceAccount";
const TOKEN_SECRET_TYPE: &str = "kubernetes.io/service-account-token";
const SERVICE_ACCOUNT_ANNOTATION: &str = "kubernetes.io/service-account.name";

pub struct KubeAuthorizer {
    client: Client,
    /// Namespace holding service accounts, token secrets and the policy map.
    namespace: String,
    instance_id: String,
}

impl KubeAuthorizer {
    pub fn new(client: Client, namespace: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Build from the ambient kubeconfig or in-cluster environment.
    pub async fn try_default(
        namespace: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Result<Self, ClusterError> {
        let client = Client::try_default().await.map_err(api_error)?;
        Ok(Self::new(client, namespace, instance_id))
    }

    fn token_secret_name(identity: &str) -> String {
        format!("{identity}-secret")
    }

    async fn ensure_token_secret(&self, identity: &str) -> Result<(), ClusterError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let name = Self::token_secret_name(identity);
        if api.get_opt(&name).await.map_err(api_error)?.is_some() {
            return Ok(());
        }

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                annotations: Some(BTreeMap::from([(
                    SERVICE_ACCOUNT_ANNOTATION.to_string(),
                    identity.to_string(),
                )])),
                ..Default::default()
            },
            type_: Some(TOKEN_SECRET_TYPE.to_string()),
            ..Default::default()
        };
        ignore_conflict(api.create(&PostParams::default(), &secret).await)?;
        debug!(secret = %name, "Created service account token secret");
        Ok(())
    }
}

#[async_trait]
impl ClusterAuthorizer for KubeAuthorizer {
    #[instrument(skip(self))]
    async fn ensure_base_role(&self) -> Result<(), ClusterError> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        if api.get_opt(USER_CLUSTER_ROLE).await.map_err(api_error)?.is_some() {
            return Ok(());
        }

        let role = ClusterRole {
            metadata: ObjectMeta {
                name: Some(USER_CLUSTER_ROLE.to_string()),
                ..Default::default()
            },
            rules: Some(user_role_rules()),
            ..Default::default()
        };
        ignore_conflict(api.create(&PostParams::default(), &role).await)?;
        info!(role = USER_CLUSTER_ROLE, "Created user cluster role");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn ensure_identity(&self, identity: &str) -> Result<(), ClusterError> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &self.namespace);
        if api.get_opt(identity).await.map_err(api_error)?.is_none() {
            let account = ServiceAccount {
                metadata: ObjectMeta {
                    name: Some(identity.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            ignore_conflict(api.create(&PostParams::default(), &account).await)?;
            info!(identity, "Created service account");
        }
        self.ensure_token_secret(identity).await
    }

    #[instrument(skip(self))]
    async fn ensure_cluster_binding(&self, identity: &str) -> Result<(), ClusterError> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());

        for _ in 0..2 {
            match api.get_opt(USER_CLUSTER_ROLE_BINDING).await.map_err(api_error)? {
                Some(mut binding) => {
                    let subjects = binding.subjects.get_or_insert_with(Vec::new);
                    if merge_subject(subjects, identity, &self.namespace) {
                        api.replace(USER_CLUSTER_ROLE_BINDING, &PostParams::default(), &binding)
                            .await
                            .map_err(api_error)?;
                        debug!(identity, "Added subject to user cluster role binding");
                    }
                    return Ok(());
                }
                None => {
                    let binding = ClusterRoleBinding {
                        metadata: ObjectMeta {
                            name: Some(USER_CLUSTER_ROLE_BINDING.to_string()),
                            ..Default::default()
                        },
                        role_ref: role_ref("ClusterRole", USER_CLUSTER_ROLE),
                        subjects: Some(vec![service_account_subject(identity, &self.namespace)]),
                    };
                    match api.create(&PostParams::default(), &binding).await {
                        Ok(_) => return Ok(()),
                        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                        Err(e) => return Err(api_error(e)),
                    }
                }
            }
        }
        Err(ClusterError::Api(format!(
            "cluster role binding {USER_CLUSTER_ROLE_BINDING} kept conflicting"
        )))
    }

    #[instrument(skip(self))]
    async fn ensure_namespace_binding(
        &self,
        identity: &str,
        namespace: &str,
    ) -> Result<(), ClusterError> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        let name = namespace_binding_name(&self.instance_id, namespace);

        for _ in 0..2 {
            match api.get_opt(&name).await.map_err(api_error)? {
                Some(mut binding) => {
                    let subjects = binding.subjects.get_or_insert_with(Vec::new);
                    if merge_subject(subjects, identity, &self.namespace) {
                        api.replace(&name, &PostParams::default(), &binding)
                            .await
                            .map_err(api_error)?;
                        debug!(identity, namespace, "Added subject to namespace role binding");
                    }
                    return Ok(());
                }
                None => {
                    let binding = RoleBinding {
                        metadata: ObjectMeta {
                            name: Some(name.clone()),
                            namespace: Some(namespace.to_string()),
                            ..Default::default()
                        },
                        role_ref: role_ref("ClusterRole", NAMESPACE_ROLE),
                        subjects: Some(vec![service_account_subject(identity, &self.namespace)]),
                    };
                    match api.create(&PostParams::default(), &binding).await {
                        Ok(_) => return Ok(()),
                        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                        Err(e) => return Err(api_error(e)),
                    }
                }
            }
        }
        Err(ClusterError::Api(format!("role binding {name} kept conflicting")))
    }

    async fn accessible_namespaces(
        &self,
        user_id: UserId,
        teams: &[TeamId],
    ) -> Result<Vec<String>, ClusterError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let raw = api
            .get_opt(POLICY_CONFIG_MAP)
            .await
            .map_err(api_error)?
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(POLICY_KEY))
            .unwrap_or_default();

        namespaces_for(&raw, user_id, teams).map_err(|e| ClusterError::InvalidPolicy(e.to_string()))
    }

    #[instrument(skip(self))]
    async fn fetch_bearer_token(&self, identity: &str) -> Result<String, ClusterError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let name = Self::token_secret_name(identity);
        let secret = api
            .get_opt(&name)
            .await
            .map_err(api_error)?
            .ok_or_else(|| ClusterError::TokenNotReady(identity.to_string()))?;

        secret
            .data
            .and_then(|mut data| data.remove("token"))
            .filter(|token| !token.0.is_empty())
            .map(|token| String::from_utf8_lossy(&token.0).into_owned())
            .ok_or_else(|| ClusterError::TokenNotReady(identity.to_string()))
    }
}

/// Append the service account subject unless an equal one is present.
/// Returns whether the list changed.
pub fn merge_subject(subjects: &mut Vec<Subject>, identity: &str, namespace: &str) -> bool {
    let present = subjects.iter().any(|s| {
        s.kind == SERVICE_ACCOUNT_KIND
            && s.name == identity
            && s.namespace.as_deref() == Some(namespace)
    });
    if present {
        return false;
    }
    subjects.push(service_account_subject(identity, namespace));
    true
}

fn service_account_subject(identity: &str, namespace: &str) -> Subject {
    Subject {
        kind: SERVICE_ACCOUNT_KIND.to_string(),
        name: identity.to_string(),
        namespace: Some(namespace.to_string()),
        api_group: None,
    }
}

fn role_ref(kind: &str, name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

fn user_role_rules() -> Vec<PolicyRule> {
    let rule = |groups: &[&str], resources: &[&str], verbs: &[&str]| PolicyRule {
        api_groups: Some(groups.iter().map(ToString::to_string).collect()),
        resources: Some(resources.iter().map(ToString::to_string).collect()),
        verbs: verbs.iter().map(ToString::to_string).collect(),
        ..Default::default()
    };
    vec![
        rule(&[""], &["namespaces", "nodes"], &["get", "list"]),
        rule(&["storage.k8s.io"], &["storageclasses"], &["list"]),
        rule(&["networking.k8s.io"], &["ingressclasses"], &["list"]),
        rule(&["metrics.k8s.io"], &["nodes", "pods"], &["get", "list"]),
    ]
}

fn ignore_conflict<T>(result: Result<T, kube::Error>) -> Result<(), ClusterError> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(api_error(e)),
    }
}

fn api_error(e: kube::Error) -> ClusterError {
    ClusterError::Api(e.to_string())
}
