//! Storage layer tests for the relay.

#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeMap;

use outpost_kube::TeamMemberships;

use super::RelayDatabase;
use super::models::{EndpointType, JobEndpointMeta};
use crate::registry::LogsStatus;
use outpost_core::db::DatabaseError;

async fn test_db() -> RelayDatabase {
    RelayDatabase::open_in_memory().await.unwrap()
}

// === Endpoint tests ===

#[tokio::test]
async fn create_and_get_endpoint() {
    let db = test_db().await;
    let endpoint = db
        .create_endpoint("edge-1", EndpointType::EdgeAgentOnDocker, "", 0)
        .await
        .unwrap();

    assert_eq!(endpoint.name, "edge-1");
    assert_eq!(endpoint.kind(), Some(EndpointType::EdgeAgentOnDocker));
    assert!(endpoint.edge_id.is_none());

    let fetched = db.get_endpoint(endpoint.id).await.unwrap();
    assert_eq!(fetched.name, "edge-1");
}

#[tokio::test]
async fn missing_endpoint_is_not_found() {
    let db = test_db().await;
    assert!(matches!(
        db.get_endpoint(99).await,
        Err(DatabaseError::NotFound(_))
    ));
}

#[tokio::test]
async fn duplicate_endpoint_name_rejected() {
    let db = test_db().await;
    db.create_endpoint("local", EndpointType::Docker, "unix:///var/run/docker.sock", 0)
        .await
        .unwrap();
    assert!(
        db.create_endpoint("local", EndpointType::Docker, "tcp://other:2375", 0)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn checkin_binds_edge_id_once() {
    let db = test_db().await;
    let endpoint = db
        .create_endpoint("edge-1", EndpointType::EdgeAgentOnKubernetes, "", 10)
        .await
        .unwrap();

    assert!(db.record_checkin(endpoint.id, "agent-a").await.unwrap());
    let first = db.get_endpoint(endpoint.id).await.unwrap();
    assert!(!db.record_checkin(endpoint.id, "agent-b").await.unwrap());
    assert!(db.record_checkin(endpoint.id, "agent-a").await.unwrap());

    let fetched = db.get_endpoint(endpoint.id).await.unwrap();
    assert_eq!(fetched.edge_id.as_deref(), Some("agent-a"));
    assert!(first.last_checkin_at.is_some());
    assert!(!db.record_checkin(999, "agent-a").await.unwrap());
}

#[tokio::test]
async fn edge_key_and_delete() {
    let db = test_db().await;
    let endpoint = db
        .create_endpoint("edge-1", EndpointType::EdgeAgentOnDocker, "", 0)
        .await
        .unwrap();

    assert!(db.set_endpoint_edge_key(endpoint.id, "a2V5").await.unwrap());
    assert_eq!(db.get_endpoint(endpoint.id).await.unwrap().edge_key, "a2V5");

    assert!(db.delete_endpoint(endpoint.id).await.unwrap());
    assert!(!db.delete_endpoint(endpoint.id).await.unwrap());
    assert!(db.list_endpoints().await.unwrap().is_empty());
}

// === Edge job tests ===

#[tokio::test]
async fn edge_job_endpoints_persist_as_map() {
    let db = test_db().await;
    let job = db.create_edge_job("backup", "0 * * * *", true).await.unwrap();
    assert!(job.endpoints.is_empty());
    assert_eq!(job.version, 1);

    let mut endpoints = BTreeMap::new();
    endpoints.insert(
        3,
        JobEndpointMeta {
            logs_status: LogsStatus::Pending,
            collect_logs: true,
        },
    );
    endpoints.insert(4, JobEndpointMeta::default());
    db.update_edge_job_endpoints(job.id, &endpoints).await.unwrap();

    let fetched = db.get_edge_job(job.id).await.unwrap();
    assert_eq!(fetched.endpoints, endpoints);
    assert!(fetched.recurring);
}

#[tokio::test]
async fn script_update_bumps_version() {
    let db = test_db().await;
    let job = db.create_edge_job("once", "5 4 * * *", false).await.unwrap();

    db.set_edge_job_script(job.id, "edge_jobs/1/job.sh")
        .await
        .unwrap();
    let fetched = db.get_edge_job(job.id).await.unwrap();
    assert_eq!(fetched.script_path, "edge_jobs/1/job.sh");
    assert_eq!(fetched.version, 2);

    assert!(matches!(
        db.set_edge_job_script(999, "x").await,
        Err(DatabaseError::NotFound(_))
    ));
}

#[tokio::test]
async fn delete_edge_job() {
    let db = test_db().await;
    let job = db.create_edge_job("once", "5 4 * * *", false).await.unwrap();
    assert!(db.delete_edge_job(job.id).await.unwrap());
    assert!(db.get_edge_job(job.id).await.is_err());
    assert!(db.list_edge_jobs().await.unwrap().is_empty());
}

// === Team membership tests ===

#[tokio::test]
async fn memberships_feed_team_lookup() {
    let db = test_db().await;
    db.add_team_membership(3, 10, "member").await.unwrap();
    db.add_team_membership(3, 9, "leader").await.unwrap();
    db.add_team_membership(4, 9, "member").await.unwrap();

    assert_eq!(db.memberships_for_user(3).await.unwrap(), vec![9, 10]);
    assert_eq!(db.memberships_for_user(5).await.unwrap(), Vec::<i64>::new());

    assert!(db.remove_team_membership(3, 10).await.unwrap());
    assert_eq!(db.memberships_for_user(3).await.unwrap(), vec![9]);
}

#[tokio::test]
async fn membership_role_is_upserted() {
    let db = test_db().await;
    db.add_team_membership(3, 9, "member").await.unwrap();
    db.add_team_membership(3, 9, "leader").await.unwrap();

    let memberships = db.list_team_memberships(3).await.unwrap();
    assert_eq!(memberships.len(), 1);
    assert_eq!(memberships[0].role, "leader");
}
