//! Namespace access policies.
//!
//! Stored as JSON in the `NamespaceAccessPolicies` key of the instance's
//! config map:
//!
//! ```json
//! { "team-a": { "UserAccessPolicies": { "3": {} }, "TeamAccessPolicies": { "9": {} } } }
//! ```

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

use crate::{TeamId, UserId};

/// Config map holding the policies.
pub const POLICY_CONFIG_MAP: &str = "outpost-config";

/// Key inside [`POLICY_CONFIG_MAP`].
pub const POLICY_KEY: &str = "NamespaceAccessPolicies";

#[derive(Debug, Default, Deserialize)]
struct NamespaceAccessPolicy {
    #[serde(rename = "UserAccessPolicies", default)]
    users: HashMap<String, serde_json::Value>,
    #[serde(rename = "TeamAccessPolicies", default)]
    teams: HashMap<String, serde_json::Value>,
}

/// Namespaces granted to `user_id` or any of `teams`, in name order.
pub fn namespaces_for(
    raw: &str,
    user_id: UserId,
    teams: &[TeamId],
) -> Result<Vec<String>, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    let policies: BTreeMap<String, NamespaceAccessPolicy> = serde_json::from_str(raw)?;
    let user_key = user_id.to_string();
    let team_keys: Vec<String> = teams.iter().map(ToString::to_string).collect();

    Ok(policies
        .into_iter()
        .filter(|(_, policy)| {
            policy.users.contains_key(&user_key)
                || team_keys.iter().any(|t| policy.teams.contains_key(t))
        })
        .map(|(namespace, _)| namespace)
        .collect())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    const POLICIES: &str = r#"{
        "team-a": { "TeamAccessPolicies": { "9": {"RoleId": 0} } },
        "alice-only": { "UserAccessPolicies": { "3": {} } },
        "nobody": { "UserAccessPolicies": {}, "TeamAccessPolicies": {} }
    }"#;

    #[test]
    fn direct_and_team_grants() {
        let namespaces = namespaces_for(POLICIES, 3, &[9]).unwrap();
        assert_eq!(namespaces, vec!["alice-only", "team-a"]);
    }

    #[test]
    fn team_grant_only() {
        assert_eq!(namespaces_for(POLICIES, 4, &[9]).unwrap(), vec!["team-a"]);
    }

    #[test]
    fn no_grants() {
        assert!(namespaces_for(POLICIES, 4, &[1, 2]).unwrap().is_empty());
    }

    #[test]
    fn empty_document_grants_nothing() {
        assert!(namespaces_for("", 3, &[]).unwrap().is_empty());
    }

    #[test]
    fn malformed_document_is_error() {
        assert!(namespaces_for("[1, 2", 3, &[]).is_err());
    }
}
