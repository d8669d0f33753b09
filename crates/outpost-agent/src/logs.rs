//! Sources of job output uploaded to the relay.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;

/// Where the agent finds the output of a job's last run.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Output of the last run of `job_id`, or `None` if it has not run.
    async fn job_logs(&self, job_id: i64) -> io::Result<Option<Vec<u8>>>;
}

/// Reads `{dir}/{job_id}.log`, as written by the host's job scheduler.
#[derive(Debug, Clone)]
pub struct DirLogSource {
    dir: PathBuf,
}

impl DirLogSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl LogSource for DirLogSource {
    async fn job_logs(&self, job_id: i64) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.dir.join(format!("{job_id}.log"))).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_job_log_by_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("4.log"), b"done").unwrap();
        let source = DirLogSource::new(dir.path());

        assert_eq!(source.job_logs(4).await.unwrap().unwrap(), b"done");
        assert!(source.job_logs(5).await.unwrap().is_none());
    }
}
