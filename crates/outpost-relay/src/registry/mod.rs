//! In-memory registry of per-endpoint tunnel state.
//!
//! The registry owns every [`TunnelEntry`]; the tunnel server, proxy resolver
//! and job dispatcher all go through it. One registry-wide lock serializes
//! mutation; it is never held across an `.await`.

mod entry;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use rand::RngExt;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

pub use entry::{
    EndpointId, EndpointJob, JobId, LogsStatus, TunnelDetails, TunnelStatus,
};
use entry::TunnelEntry;

const CREDENTIALS_LEN: usize = 32;

#[derive(Clone, Default)]
pub struct TunnelRegistry {
    entries: Arc<RwLock<HashMap<EndpointId, TunnelEntry>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<EndpointId, TunnelEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<EndpointId, TunnelEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the endpoint's agent to open a tunnel.
    ///
    /// Mints fresh one-time credentials unless the entry is already
    /// required, in which case the outstanding credentials are returned.
    pub fn require_tunnel(&self, endpoint: EndpointId) -> String {
        let mut entries = self.write();
        let entry = entries.entry(endpoint).or_default();
        if entry.status == TunnelStatus::Required {
            return entry.credentials.clone();
        }

        entry.status = TunnelStatus::Required;
        entry.port = 0;
        entry.credentials = generate_credentials();
        info!(endpoint_id = endpoint, "Tunnel required");
        entry.credentials.clone()
    }

    /// REQUIRED → ACTIVE on `port`. Returns `false` from any other state.
    pub fn activate(&self, endpoint: EndpointId, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        let mut entries = self.write();
        let Some(entry) = entries.get_mut(&endpoint) else {
            return false;
        };
        if entry.status != TunnelStatus::Required {
            return false;
        }

        entry.status = TunnelStatus::Active;
        entry.port = port;
        entry.credentials.clear();
        entry.last_activity = Some(SystemTime::now());
        info!(endpoint_id = endpoint, port, "Tunnel active");
        true
    }

    /// Any state → IDLE.
    pub fn mark_idle(&self, endpoint: EndpointId) {
        let mut entries = self.write();
        let entry = entries.entry(endpoint).or_default();
        if entry.status != TunnelStatus::Idle {
            info!(endpoint_id = endpoint, from = %entry.status, "Tunnel idle");
        }
        entry.reset();
    }

    /// Mark idle only if the entry is still the tunnel active on `port`.
    ///
    /// Closing sessions use this so a stale session cannot reset a tunnel
    /// that was re-required or re-established in the meantime.
    pub fn release(&self, endpoint: EndpointId, port: u16) -> bool {
        let mut entries = self.write();
        match entries.get_mut(&endpoint) {
            Some(entry) if entry.status == TunnelStatus::Active && entry.port == port => {
                entry.reset();
                info!(endpoint_id = endpoint, port, "Tunnel released");
                true
            }
            _ => false,
        }
    }

    /// Record traffic on an active tunnel.
    pub fn touch(&self, endpoint: EndpointId) -> bool {
        let mut entries = self.write();
        match entries.get_mut(&endpoint) {
            Some(entry) if entry.status == TunnelStatus::Active => {
                entry.last_activity = Some(SystemTime::now());
                true
            }
            _ => false,
        }
    }

    pub fn status(&self, endpoint: EndpointId) -> TunnelStatus {
        self.read()
            .get(&endpoint)
            .map(|e| e.status)
            .unwrap_or_default()
    }

    /// Snapshot of the entry; defaults for endpoints never referenced.
    pub fn details(&self, endpoint: EndpointId) -> TunnelDetails {
        self.read()
            .get(&endpoint)
            .map(TunnelEntry::snapshot)
            .unwrap_or_default()
    }

    /// Constant-time check of presented one-time credentials.
    ///
    /// Unknown endpoints, non-required entries and mismatches all yield
    /// `false`.
    pub fn verify_credentials(&self, endpoint: EndpointId, presented: &str) -> bool {
        let entries = self.read();
        let Some(entry) = entries.get(&endpoint) else {
            return false;
        };
        if entry.status != TunnelStatus::Required || entry.credentials.is_empty() {
            return false;
        }
        entry
            .credentials
            .as_bytes()
            .ct_eq(presented.as_bytes())
            .into()
    }

    /// Drop the entry of a deleted endpoint.
    pub fn remove(&self, endpoint: EndpointId) -> bool {
        let removed = self.write().remove(&endpoint).is_some();
        if removed {
            debug!(endpoint_id = endpoint, "Tunnel entry removed");
        }
        removed
    }

    /// Active endpoints with no traffic since `cutoff`.
    pub fn idle_since(&self, cutoff: SystemTime) -> Vec<EndpointId> {
        self.read()
            .iter()
            .filter(|(_, e)| {
                e.status == TunnelStatus::Active && e.last_activity.is_none_or(|t| t < cutoff)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.read()
            .values()
            .filter(|e| e.status == TunnelStatus::Active)
            .count()
    }

    // Job bookkeeping, written only by the dispatcher.

    /// Add `job` to the endpoint once. An existing assignment is reset to
    /// IDLE and takes the new `collect_logs` flag.
    pub(crate) fn add_job(&self, endpoint: EndpointId, job: JobId, collect_logs: bool) {
        let mut entries = self.write();
        let entry = entries.entry(endpoint).or_default();
        if let Some(existing) = entry.jobs.iter_mut().find(|j| j.job_id == job) {
            existing.logs_status = LogsStatus::Idle;
            existing.collect_logs = collect_logs;
            return;
        }
        entry.jobs.push(EndpointJob {
            job_id: job,
            logs_status: LogsStatus::Idle,
            collect_logs,
        });
    }

    /// Restore an assignment with a known log status.
    pub(crate) fn restore_job(&self, endpoint: EndpointId, job: EndpointJob) {
        let mut entries = self.write();
        let entry = entries.entry(endpoint).or_default();
        entry.jobs.retain(|j| j.job_id != job.job_id);
        entry.jobs.push(job);
    }

    pub(crate) fn remove_job(&self, endpoint: EndpointId, job: JobId) -> bool {
        let mut entries = self.write();
        let Some(entry) = entries.get_mut(&endpoint) else {
            return false;
        };
        let before = entry.jobs.len();
        entry.jobs.retain(|j| j.job_id != job);
        entry.jobs.len() != before
    }

    /// Run `f` on the (endpoint, job) assignment under the registry lock.
    pub(crate) fn update_job<R>(
        &self,
        endpoint: EndpointId,
        job: JobId,
        f: impl FnOnce(&mut EndpointJob) -> R,
    ) -> Option<R> {
        let mut entries = self.write();
        entries
            .get_mut(&endpoint)?
            .jobs
            .iter_mut()
            .find(|j| j.job_id == job)
            .map(f)
    }
}

fn generate_credentials() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..CREDENTIALS_LEN)
        .map(|_| char::from(CHARSET[rng.random_range(0..CHARSET.len())]))
        .collect()
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unknown_endpoint_is_idle_and_not_inserted() {
        let registry = TunnelRegistry::new();
        assert_eq!(registry.status(42), TunnelStatus::Idle);
        let details = registry.details(42);
        assert_eq!(details.port, 0);
        assert!(details.credentials.is_empty());
        assert!(details.jobs.is_empty());
        assert!(!registry.remove(42));
    }

    #[test]
    fn require_activate_idle_cycle() {
        let registry = TunnelRegistry::new();

        let creds = registry.require_tunnel(7);
        assert_eq!(creds.len(), CREDENTIALS_LEN);
        let details = registry.details(7);
        assert_eq!(details.status, TunnelStatus::Required);
        assert_eq!(details.credentials, creds);
        assert_eq!(details.port, 0);

        assert!(registry.activate(7, 41000));
        let details = registry.details(7);
        assert_eq!(details.status, TunnelStatus::Active);
        assert_eq!(details.port, 41000);
        assert!(details.credentials.is_empty());
        assert!(details.last_activity.is_some());

        registry.mark_idle(7);
        let details = registry.details(7);
        assert_eq!(details.status, TunnelStatus::Idle);
        assert_eq!(details.port, 0);
        assert_eq!(details.credentials, "");
    }

    #[test]
    fn require_is_idempotent_while_required() {
        let registry = TunnelRegistry::new();
        let first = registry.require_tunnel(1);
        let second = registry.require_tunnel(1);
        assert_eq!(first, second);
    }

    #[test]
    fn require_from_active_mints_new_credentials_and_clears_port() {
        let registry = TunnelRegistry::new();
        let first = registry.require_tunnel(1);
        assert!(registry.activate(1, 5000));

        let second = registry.require_tunnel(1);
        assert_ne!(first, second);
        let details = registry.details(1);
        assert_eq!(details.status, TunnelStatus::Required);
        assert_eq!(details.port, 0);
    }

    #[test]
    fn activate_requires_required_state() {
        let registry = TunnelRegistry::new();
        assert!(!registry.activate(1, 5000));
        assert_eq!(registry.status(1), TunnelStatus::Idle);

        registry.require_tunnel(1);
        assert!(!registry.activate(1, 0));
        assert!(registry.activate(1, 5000));
        assert!(!registry.activate(1, 5001));
        assert_eq!(registry.details(1).port, 5000);
    }

    #[test]
    fn credentials_are_single_use() {
        let registry = TunnelRegistry::new();
        let creds = registry.require_tunnel(3);

        assert!(!registry.verify_credentials(3, "wrong"));
        assert!(!registry.verify_credentials(4, &creds));
        assert!(registry.verify_credentials(3, &creds));

        assert!(registry.activate(3, 6000));
        assert!(!registry.verify_credentials(3, &creds));
        assert!(!registry.verify_credentials(3, ""));
    }

    #[test]
    fn touch_only_affects_active_entries() {
        let registry = TunnelRegistry::new();
        assert!(!registry.touch(1));
        registry.require_tunnel(1);
        assert!(!registry.touch(1));
        registry.activate(1, 7000);
        assert!(registry.touch(1));
    }

    #[test]
    fn release_ignores_stale_sessions() {
        let registry = TunnelRegistry::new();
        registry.require_tunnel(1);
        registry.activate(1, 7000);

        assert!(!registry.release(1, 7001));
        assert_eq!(registry.status(1), TunnelStatus::Active);

        registry.require_tunnel(1);
        assert!(!registry.release(1, 7000));
        assert_eq!(registry.status(1), TunnelStatus::Required);

        registry.activate(1, 7002);
        assert!(registry.release(1, 7002));
        assert_eq!(registry.status(1), TunnelStatus::Idle);
    }

    #[test]
    fn idle_since_lists_stale_active_tunnels() {
        let registry = TunnelRegistry::new();
        registry.require_tunnel(1);
        registry.activate(1, 7000);
        registry.require_tunnel(2);

        let future = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(registry.idle_since(future), vec![1]);

        let past = SystemTime::now() - Duration::from_secs(60);
        assert!(registry.idle_since(past).is_empty());
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn jobs_survive_tunnel_transitions() {
        let registry = TunnelRegistry::new();
        registry.add_job(5, 100, true);
        registry.require_tunnel(5);
        registry.activate(5, 8000);
        registry.mark_idle(5);

        let jobs = registry.details(5).jobs;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, 100);
        assert_eq!(jobs[0].logs_status, LogsStatus::Idle);
    }

    #[test]
    fn add_job_is_exactly_once() {
        let registry = TunnelRegistry::new();
        registry.add_job(5, 100, false);
        registry
            .update_job(5, 100, |j| j.logs_status = LogsStatus::Pending)
            .unwrap();
        registry.add_job(5, 100, true);

        let jobs = registry.details(5).jobs;
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].collect_logs);
        assert_eq!(jobs[0].logs_status, LogsStatus::Pending);

        assert!(registry.remove_job(5, 100));
        assert!(!registry.remove_job(5, 100));
        assert!(registry.update_job(5, 100, |_| ()).is_none());
    }

    #[test]
    fn concurrent_require_yields_one_credential() {
        let registry = TunnelRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = registry.clone();
                std::thread::spawn(move || r.require_tunnel(9))
            })
            .collect();
        let creds: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(creds.iter().all(|c| c == &creds[0]));
    }
}
