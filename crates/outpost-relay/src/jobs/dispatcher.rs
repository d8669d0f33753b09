//! Assigns edge jobs to endpoints and tracks per-endpoint log collection.
//!
//! Every job assignment lives twice: in the endpoint's tunnel entry (read by
//! check-ins) and in the job record (read by operators). The dispatcher is
//! the only writer of both and serializes its writes so they never diverge.

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use outpost_core::db::DatabaseError;
use outpost_proto::EdgeJobSchedule;

use super::error::JobError;
use super::files::FileStore;
use crate::registry::{EndpointId, EndpointJob, JobId, LogsStatus, TunnelRegistry};
use crate::storage::{EdgeJob, JobEndpointMeta, RelayDatabase};

/// One (job, endpoint) pair as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeJobTask {
    pub id: String,
    pub endpoint_id: EndpointId,
    pub logs_status: LogsStatus,
}

pub struct EdgeJobDispatcher {
    registry: TunnelRegistry,
    db: RelayDatabase,
    files: FileStore,
    writes: Mutex<()>,
}

impl EdgeJobDispatcher {
    pub fn new(registry: TunnelRegistry, db: RelayDatabase, files: FileStore) -> Self {
        Self {
            registry,
            db,
            files,
            writes: Mutex::new(()),
        }
    }

    /// Rebuild registry job lists from stored jobs after a restart.
    pub async fn restore(&self) -> Result<usize, JobError> {
        let _guard = self.writes.lock().await;
        let jobs = self.db.list_edge_jobs().await?;
        let mut restored = 0;
        for job in &jobs {
            for (endpoint, meta) in &job.endpoints {
                self.registry.restore_job(
                    *endpoint,
                    EndpointJob {
                        job_id: job.id,
                        logs_status: meta.logs_status,
                        collect_logs: meta.collect_logs,
                    },
                );
                restored += 1;
            }
        }
        info!(jobs = jobs.len(), assignments = restored, "Edge job assignments restored");
        Ok(restored)
    }

    /// Create a job, store its script, and assign it to `endpoints`.
    #[instrument(skip(self, script), fields(script_len = script.len()))]
    pub async fn create(
        &self,
        name: &str,
        cron_expression: &str,
        recurring: bool,
        script: &[u8],
        endpoints: &[EndpointId],
    ) -> Result<EdgeJob, JobError> {
        for endpoint in endpoints {
            self.db.get_endpoint(*endpoint).await.map_err(not_found)?;
        }

        let job = self
            .db
            .create_edge_job(name, cron_expression, recurring)
            .await?;
        let script_path = self.files.store_script(job.id, script).await?;
        self.db.set_edge_job_script(job.id, &script_path).await?;
        info!(job_id = job.id, name, "Edge job created");

        self.assign(job.id, endpoints).await
    }

    /// Make `endpoints` the exact set the job runs on.
    ///
    /// Every endpoint in the set starts over at IDLE, including endpoints
    /// kept from a previous assignment.
    #[instrument(skip(self))]
    pub async fn assign(&self, job: JobId, endpoints: &[EndpointId]) -> Result<EdgeJob, JobError> {
        let _guard = self.writes.lock().await;
        let mut record = self.load(job).await?;

        let wanted: BTreeSet<EndpointId> = endpoints.iter().copied().collect();
        let updated: BTreeMap<EndpointId, JobEndpointMeta> = wanted
            .iter()
            .map(|endpoint| (*endpoint, JobEndpointMeta::default()))
            .collect();
        let dropped: Vec<EndpointId> = record
            .endpoints
            .keys()
            .filter(|e| !wanted.contains(e))
            .copied()
            .collect();

        self.db.update_edge_job_endpoints(job, &updated).await?;

        for endpoint in &dropped {
            self.registry.remove_job(*endpoint, job);
        }
        for (endpoint, meta) in &updated {
            self.registry.add_job(*endpoint, job, meta.collect_logs);
        }
        debug!(job_id = job, assigned = updated.len(), dropped = dropped.len(), "Edge job assigned");

        record.endpoints = updated;
        Ok(record)
    }

    /// Request logs: IDLE → PENDING.
    ///
    /// Also requires the endpoint's tunnel so the agent connects and uploads.
    #[instrument(skip(self))]
    pub async fn mark_pending(&self, job: JobId, endpoint: EndpointId) -> Result<(), JobError> {
        let _guard = self.writes.lock().await;
        self.transition(job, endpoint, &[LogsStatus::Idle], LogsStatus::Pending, true)
            .await?;
        self.registry.require_tunnel(endpoint);
        Ok(())
    }

    /// PENDING → COLLECTED.
    pub async fn mark_collected(&self, job: JobId, endpoint: EndpointId) -> Result<(), JobError> {
        let _guard = self.writes.lock().await;
        self.transition(job, endpoint, &[LogsStatus::Pending], LogsStatus::Collected, false)
            .await
    }

    /// Store an uploaded log and mark the task collected.
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    pub async fn store_log(
        &self,
        job: JobId,
        endpoint: EndpointId,
        data: &[u8],
    ) -> Result<(), JobError> {
        let _guard = self.writes.lock().await;
        let current = self.current(job, endpoint)?;
        if current.logs_status != LogsStatus::Pending {
            return Err(JobError::InvalidTransition {
                job,
                endpoint,
                from: current.logs_status,
                to: LogsStatus::Collected,
            });
        }

        self.files.store_log(job, endpoint, data).await?;
        self.transition(job, endpoint, &[LogsStatus::Pending], LogsStatus::Collected, false)
            .await?;
        info!(job_id = job, endpoint_id = endpoint, "Edge job logs collected");
        Ok(())
    }

    /// Delete a collected log and return the task to IDLE.
    pub async fn clear_log(&self, job: JobId, endpoint: EndpointId) -> Result<(), JobError> {
        let _guard = self.writes.lock().await;
        self.current(job, endpoint)?;
        self.files.clear_log(job, endpoint).await?;
        self.transition(
            job,
            endpoint,
            &[LogsStatus::Idle, LogsStatus::Pending, LogsStatus::Collected],
            LogsStatus::Idle,
            false,
        )
        .await
    }

    /// Start a new run: every endpoint of the job goes back to IDLE.
    pub async fn reset_run(&self, job: JobId) -> Result<(), JobError> {
        let _guard = self.writes.lock().await;
        let mut record = self.load(job).await?;
        for meta in record.endpoints.values_mut() {
            meta.logs_status = LogsStatus::Idle;
        }
        self.db.update_edge_job_endpoints(job, &record.endpoints).await?;

        for endpoint in record.endpoints.keys() {
            self.registry
                .update_job(*endpoint, job, |j| j.logs_status = LogsStatus::Idle);
        }
        debug!(job_id = job, "Edge job run reset");
        Ok(())
    }

    /// Delete the job, its assignments, and its stored artifacts.
    ///
    /// Artifacts go first; if they cannot be deleted the job is left intact.
    #[instrument(skip(self))]
    pub async fn remove(&self, job: JobId) -> Result<(), JobError> {
        let _guard = self.writes.lock().await;
        let record = self.load(job).await?;

        self.files.delete_job_artifacts(job).await?;
        for endpoint in record.endpoints.keys() {
            self.registry.remove_job(*endpoint, job);
        }
        self.db.delete_edge_job(job).await?;
        info!(job_id = job, "Edge job removed");
        Ok(())
    }

    /// Drop a deleted endpoint from every job that references it.
    pub async fn forget_endpoint(&self, endpoint: EndpointId) -> Result<usize, JobError> {
        let _guard = self.writes.lock().await;
        let mut touched = 0;
        for mut job in self.db.list_edge_jobs().await? {
            if job.endpoints.remove(&endpoint).is_some() {
                self.db.update_edge_job_endpoints(job.id, &job.endpoints).await?;
                self.registry.remove_job(endpoint, job.id);
                if let Err(e) = self.files.clear_log(job.id, endpoint).await {
                    warn!(job_id = job.id, endpoint_id = endpoint, error = %e, "Failed to delete job log");
                }
                touched += 1;
            }
        }
        Ok(touched)
    }

    /// Collected log of one task.
    pub async fn task_logs(&self, job: JobId, endpoint: EndpointId) -> Result<Vec<u8>, JobError> {
        match self.files.read_log(job, endpoint).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(JobError::LogNotAvailable { job, endpoint })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn tasks(&self, job: JobId) -> Result<Vec<EdgeJobTask>, JobError> {
        let record = self.load(job).await?;
        Ok(record
            .endpoints
            .iter()
            .map(|(endpoint, meta)| EdgeJobTask {
                id: format!("edgejob_task_{job}_{endpoint}"),
                endpoint_id: *endpoint,
                logs_status: meta.logs_status,
            })
            .collect())
    }

    /// Schedules handed to the endpoint's agent on check-in.
    ///
    /// Jobs whose record or script cannot be read are skipped with a warning.
    pub async fn schedules_for(&self, endpoint: EndpointId) -> Vec<EdgeJobSchedule> {
        let mut schedules = Vec::new();
        for assigned in self.registry.details(endpoint).jobs {
            let job = match self.db.get_edge_job(assigned.job_id).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = assigned.job_id, endpoint_id = endpoint, error = %e, "Skipping edge job");
                    continue;
                }
            };
            let script = match self.files.read_script(&job.script_path).await {
                Ok(script) => script,
                Err(e) => {
                    warn!(job_id = job.id, error = %e, "Skipping edge job with unreadable script");
                    continue;
                }
            };
            schedules.push(EdgeJobSchedule {
                id: job.id,
                cron_expression: job.cron_expression,
                script,
                collect_logs: assigned.collect_logs,
                version: i32::try_from(job.version).unwrap_or(i32::MAX),
                recurring: job.recurring,
            });
        }
        schedules
    }

    fn current(&self, job: JobId, endpoint: EndpointId) -> Result<EndpointJob, JobError> {
        self.registry
            .details(endpoint)
            .jobs
            .into_iter()
            .find(|j| j.job_id == job)
            .ok_or_else(|| JobError::NotFound(format!("Job {job} on endpoint {endpoint}")))
    }

    async fn load(&self, job: JobId) -> Result<EdgeJob, JobError> {
        self.db.get_edge_job(job).await.map_err(not_found)
    }

    /// Move one task's log status; caller holds the write lock.
    ///
    /// `collect_logs` is set when entering PENDING and cleared otherwise.
    async fn transition(
        &self,
        job: JobId,
        endpoint: EndpointId,
        allowed_from: &[LogsStatus],
        to: LogsStatus,
        collect_logs: bool,
    ) -> Result<(), JobError> {
        let current = self.current(job, endpoint)?;
        if !allowed_from.contains(&current.logs_status) {
            return Err(JobError::InvalidTransition {
                job,
                endpoint,
                from: current.logs_status,
                to,
            });
        }

        let mut record = self.load(job).await?;
        record.endpoints.insert(
            endpoint,
            JobEndpointMeta {
                logs_status: to,
                collect_logs,
            },
        );
        self.db.update_edge_job_endpoints(job, &record.endpoints).await?;

        self.registry.update_job(endpoint, job, |j| {
            j.logs_status = to;
            j.collect_logs = collect_logs;
        });
        debug!(job_id = job, endpoint_id = endpoint, from = %current.logs_status, to = %to, "Job logs status changed");
        Ok(())
    }
}

fn not_found(e: DatabaseError) -> JobError {
    match e {
        DatabaseError::NotFound(what) => JobError::NotFound(what),
        other => JobError::Storage(other),
    }
}
