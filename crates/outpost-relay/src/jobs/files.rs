//! On-disk storage for edge job scripts and collected logs.
//!
//! Layout under the root:
//!
//! ```text
//! edge_jobs/{job}/job.sh
//! edge_jobs/{job}/logs_{endpoint}
//! ```

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::registry::{EndpointId, JobId};

const JOBS_DIR: &str = "edge_jobs";
const SCRIPT_FILE: &str = "job.sh";

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, job: JobId) -> PathBuf {
        self.root.join(JOBS_DIR).join(job.to_string())
    }

    fn log_path(&self, job: JobId, endpoint: EndpointId) -> PathBuf {
        self.job_dir(job).join(format!("logs_{endpoint}"))
    }

    /// Write the job script; returns its path relative to the root.
    pub async fn store_script(&self, job: JobId, script: &[u8]) -> io::Result<String> {
        let dir = self.job_dir(job);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(SCRIPT_FILE), script).await?;
        Ok(format!("{JOBS_DIR}/{job}/{SCRIPT_FILE}"))
    }

    /// Read a script by the relative path returned from [`Self::store_script`].
    pub async fn read_script(&self, relative: &str) -> io::Result<Vec<u8>> {
        let path = Path::new(relative);
        if path.is_absolute() || path.components().any(|c| c == std::path::Component::ParentDir) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("script path escapes the file store: {relative}"),
            ));
        }
        tokio::fs::read(self.root.join(path)).await
    }

    pub async fn store_log(&self, job: JobId, endpoint: EndpointId, data: &[u8]) -> io::Result<()> {
        let dir = self.job_dir(job);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(self.log_path(job, endpoint), data).await?;
        debug!(job_id = job, endpoint_id = endpoint, bytes = data.len(), "Stored job log");
        Ok(())
    }

    pub async fn read_log(&self, job: JobId, endpoint: EndpointId) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.log_path(job, endpoint)).await
    }

    /// Remove a collected log. A missing file is not an error.
    pub async fn clear_log(&self, job: JobId, endpoint: EndpointId) -> io::Result<()> {
        ignore_missing(tokio::fs::remove_file(self.log_path(job, endpoint)).await)
    }

    /// Remove the script and every log of `job`.
    pub async fn delete_job_artifacts(&self, job: JobId) -> io::Result<()> {
        ignore_missing(tokio::fs::remove_dir_all(self.job_dir(job)).await)
    }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
