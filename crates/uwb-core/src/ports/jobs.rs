//! Job store port: the sole authority for job state.
//!
//! Every mutation runs in its own transaction and bumps `updated_at`; status
//! transitions for a single job are linearized through the store.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::job::{JobRecord, JobStatus};

/// Terminal-state update bundle written when a supervisor or operation
/// handler returns.
#[derive(Debug, Clone)]
pub struct JobFinish {
    pub status: JobStatus,
    pub return_code: Option<i64>,
    pub error: Option<String>,
    pub artifact_path: Option<String>,
}

impl JobFinish {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            return_code: None,
            error: None,
            artifact_path: None,
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Readiness probe (`SELECT 1` or equivalent).
    async fn ping(&self) -> bool;

    async fn insert(&self, job: &JobRecord) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Recent jobs, newest first.
    async fn list_recent(&self, limit: u32) -> Result<Vec<JobRecord>, StoreError>;

    async fn set_queue_job_id(&self, id: &str, queue_job_id: &str) -> Result<(), StoreError>;

    /// `queued` -> `running`, recording `started_at` and the log path.
    /// Returns `false` when the job was not in `queued` (e.g. canceled while
    /// waiting), in which case the caller must not execute it.
    async fn mark_running(&self, id: &str, log_path: &str) -> Result<bool, StoreError>;

    /// Record (or clear) the child's process-group leader pid.
    async fn set_process_pid(&self, id: &str, pid: Option<i64>) -> Result<(), StoreError>;

    /// Replace the advisory error text without touching status.
    async fn set_error(&self, id: &str, error: &str) -> Result<(), StoreError>;

    /// Enter a terminal status, recording `finished_at` and clearing the pid.
    /// Refuses to overwrite an already-terminal status.
    async fn mark_finished(&self, id: &str, finish: &JobFinish) -> Result<(), StoreError>;

    /// Most recent `succeeded`/`reused` job with this signature and a
    /// non-null artifact path.
    async fn find_reusable(&self, build_signature: &str)
        -> Result<Option<JobRecord>, StoreError>;

    /// Most recent `succeeded`/`reused` job for a target with an artifact.
    async fn latest_artifact_for_target(
        &self,
        target: &str,
    ) -> Result<Option<JobRecord>, StoreError>;
}
