//! Database queries for the relay.

use std::collections::BTreeMap;

use async_trait::async_trait;
use outpost_core::db::unix_timestamp;
use outpost_kube::{MembershipError, TeamId, TeamMemberships, UserId};

use super::RelayDatabase;
use super::models::{EdgeJob, EdgeJobRow, Endpoint, EndpointType, JobEndpointMeta, TeamMembership};
use crate::registry::{EndpointId, JobId};
use outpost_core::db::DatabaseError;

impl TryFrom<EdgeJobRow> for EdgeJob {
    type Error = DatabaseError;

    fn try_from(row: EdgeJobRow) -> Result<Self, DatabaseError> {
        let endpoints = serde_json::from_str(&row.endpoints)
            .map_err(|e| DatabaseError::Corrupt(format!("Edge job {} endpoints: {e}", row.id)))?;
        Ok(Self {
            id: row.id,
            name: row.name,
            cron_expression: row.cron_expression,
            recurring: row.recurring,
            script_path: row.script_path,
            version: row.version,
            endpoints,
            created_at: row.created_at,
        })
    }
}

impl RelayDatabase {
    // =========================================================================
    // Endpoint queries
    // =========================================================================

    pub async fn create_endpoint(
        &self,
        name: &str,
        endpoint_type: EndpointType,
        url: &str,
        checkin_interval_secs: i64,
    ) -> Result<Endpoint, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO endpoints (name, endpoint_type, url, checkin_interval_secs, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(endpoint_type.as_i64())
        .bind(url)
        .bind(checkin_interval_secs)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        self.get_endpoint(result.last_insert_rowid()).await
    }

    pub async fn get_endpoint(&self, id: EndpointId) -> Result<Endpoint, DatabaseError> {
        sqlx::query_as::<_, Endpoint>("SELECT * FROM endpoints WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Endpoint {id}")))
    }

    pub async fn list_endpoints(&self) -> Result<Vec<Endpoint>, DatabaseError> {
        let endpoints = sqlx::query_as::<_, Endpoint>("SELECT * FROM endpoints ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        Ok(endpoints)
    }

    pub async fn set_endpoint_edge_key(
        &self,
        id: EndpointId,
        edge_key: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE endpoints SET edge_key = ? WHERE id = ?")
            .bind(edge_key)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record an agent check-in, binding `edge_id` to the endpoint on first use.
    ///
    /// Returns `false` when the endpoint does not exist or is bound to a
    /// different edge identifier.
    pub async fn record_checkin(&self, id: EndpointId, edge_id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE endpoints SET last_checkin_at = ?, edge_id = COALESCE(edge_id, ?) \
             WHERE id = ? AND (edge_id IS NULL OR edge_id = ?)",
        )
        .bind(unix_timestamp())
        .bind(edge_id)
        .bind(id)
        .bind(edge_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_endpoint(&self, id: EndpointId) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM endpoints WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Edge job queries
    // =========================================================================

    pub async fn create_edge_job(
        &self,
        name: &str,
        cron_expression: &str,
        recurring: bool,
    ) -> Result<EdgeJob, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO edge_jobs (name, cron_expression, recurring, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(cron_expression)
        .bind(recurring)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        self.get_edge_job(result.last_insert_rowid()).await
    }

    pub async fn get_edge_job(&self, id: JobId) -> Result<EdgeJob, DatabaseError> {
        sqlx::query_as::<_, EdgeJobRow>("SELECT * FROM edge_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Edge job {id}")))?
            .try_into()
    }

    pub async fn list_edge_jobs(&self) -> Result<Vec<EdgeJob>, DatabaseError> {
        sqlx::query_as::<_, EdgeJobRow>("SELECT * FROM edge_jobs ORDER BY id")
            .fetch_all(self.pool())
            .await?
            .into_iter()
            .map(EdgeJob::try_from)
            .collect()
    }

    pub async fn update_edge_job_endpoints(
        &self,
        id: JobId,
        endpoints: &BTreeMap<EndpointId, JobEndpointMeta>,
    ) -> Result<(), DatabaseError> {
        let encoded =
            serde_json::to_string(endpoints).map_err(|e| DatabaseError::Query(e.to_string()))?;
        let result = sqlx::query("UPDATE edge_jobs SET endpoints = ? WHERE id = ?")
            .bind(encoded)
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Edge job {id}")));
        }
        Ok(())
    }

    /// Point the job at a new script and bump its version.
    pub async fn set_edge_job_script(
        &self,
        id: JobId,
        script_path: &str,
    ) -> Result<(), DatabaseError> {
        let result =
            sqlx::query("UPDATE edge_jobs SET script_path = ?, version = version + 1 WHERE id = ?")
                .bind(script_path)
                .bind(id)
                .execute(self.pool())
                .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Edge job {id}")));
        }
        Ok(())
    }

    pub async fn delete_edge_job(&self, id: JobId) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM edge_jobs WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Team membership queries
    // =========================================================================

    pub async fn add_team_membership(
        &self,
        user_id: UserId,
        team_id: TeamId,
        role: &str,
    ) -> Result<TeamMembership, DatabaseError> {
        sqlx::query(
            "INSERT INTO team_memberships (user_id, team_id, role) VALUES (?, ?, ?)
             ON CONFLICT (user_id, team_id) DO UPDATE SET role = excluded.role",
        )
        .bind(user_id)
        .bind(team_id)
        .bind(role)
        .execute(self.pool())
        .await?;

        Ok(TeamMembership {
            user_id,
            team_id,
            role: role.to_string(),
        })
    }

    pub async fn remove_team_membership(
        &self,
        user_id: UserId,
        team_id: TeamId,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM team_memberships WHERE user_id = ? AND team_id = ?")
            .bind(user_id)
            .bind(team_id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_team_memberships(
        &self,
        user_id: UserId,
    ) -> Result<Vec<TeamMembership>, DatabaseError> {
        let memberships = sqlx::query_as::<_, TeamMembership>(
            "SELECT * FROM team_memberships WHERE user_id = ? ORDER BY team_id",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(memberships)
    }
}

#[async_trait]
impl TeamMemberships for RelayDatabase {
    async fn memberships_for_user(&self, user_id: UserId) -> Result<Vec<TeamId>, MembershipError> {
        let memberships = self
            .list_team_memberships(user_id)
            .await
            .map_err(|e| MembershipError(e.to_string()))?;
        Ok(memberships.into_iter().map(|m| m.team_id).collect())
    }
}
