//! Queue workers: the builds role executes one job at a time, the controls
//! role runs up to four stop tasks concurrently. Items are dispatched by
//! function name; a handler overrunning its queue timeout leaves a `failed`
//! job, never a stuck `running` one.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use uwb_broker::{QUEUE_BUILDS, QUEUE_CONTROLS, QueueItem};
use uwb_core::job::{JobStatus, StopSignal};
use uwb_core::ports::JobFinish;

use crate::jobs::{WorkerContext, build, functions, operation, repo, stop};

/// Per-job execution cap on the builds queue.
pub const BUILDS_JOB_TIMEOUT: Duration = Duration::from_secs(12 * 3600);
/// Per-job execution cap on the controls queue.
pub const CONTROLS_JOB_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Controls queue concurrency.
pub const CONTROLS_CONCURRENCY: usize = 4;

const POP_TIMEOUT_SECS: u64 = 5;

/// Builds worker: FIFO, one job at a time, serializing the expensive disk
/// work under the workspace.
pub async fn run_builds_worker(ctx: Arc<WorkerContext>) {
    info!(queue = QUEUE_BUILDS, "builds worker started");
    loop {
        let Some(item) = ctx.queue.pop(QUEUE_BUILDS, POP_TIMEOUT_SECS).await else {
            continue;
        };
        dispatch_with_timeout(&ctx, &item, BUILDS_JOB_TIMEOUT).await;
    }
}

/// Controls worker: stop tasks are idempotent and safe to run in parallel.
pub async fn run_controls_worker(ctx: Arc<WorkerContext>) {
    info!(queue = QUEUE_CONTROLS, "controls worker started");
    let semaphore = Arc::new(Semaphore::new(CONTROLS_CONCURRENCY));
    loop {
        let Some(item) = ctx.queue.pop(QUEUE_CONTROLS, POP_TIMEOUT_SECS).await else {
            continue;
        };
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            return;
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            dispatch_with_timeout(&ctx, &item, CONTROLS_JOB_TIMEOUT).await;
            drop(permit);
        });
    }
}

async fn dispatch_with_timeout(ctx: &WorkerContext, item: &QueueItem, limit: Duration) {
    if tokio::time::timeout(limit, dispatch(ctx, item)).await.is_err() {
        let job_id = item
            .args
            .get("job_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        warn!(job_id, function = %item.function, "queue job timed out");
        let finish = JobFinish {
            status: JobStatus::Failed,
            return_code: None,
            error: Some(format!(
                "Job timed out after {} seconds",
                limit.as_secs()
            )),
            artifact_path: None,
        };
        let _ = ctx.jobs.mark_finished(job_id, &finish).await;
    }
}

/// Map a queue item to its handler. Unknown functions are dropped with a
/// warning so a newer front end cannot wedge an older worker.
pub async fn dispatch(ctx: &WorkerContext, item: &QueueItem) {
    let arg = |key: &str| {
        item.args
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let job_id = arg("job_id");

    match item.function.as_str() {
        functions::BUILD => build::run_build_job(ctx, &job_id).await,
        functions::EXTRACT_FW => {
            operation::run_extract_fw_job(ctx, &job_id, &arg("fw_key"), &arg("target")).await;
        }
        functions::DELETE_FW => {
            operation::run_delete_fw_job(ctx, &job_id, &arg("fw_type"), &arg("fw_key")).await;
        }
        functions::REPO_CLONE => {
            repo::run_repo_clone_job(ctx, &job_id, &arg("git_url"), &arg("git_ref")).await;
        }
        functions::REPO_PULL => repo::run_repo_pull_job(ctx, &job_id, &arg("git_ref")).await,
        functions::REPO_SUBMODULES => repo::run_repo_submodules_job(ctx, &job_id).await,
        functions::REPO_DELETE => repo::run_repo_delete_job(ctx, &job_id, &arg("mode")).await,
        functions::STOP_JOB => {
            let signal = if arg("signal_type") == "sigkill" {
                StopSignal::Sigkill
            } else {
                StopSignal::Sigterm
            };
            stop::run_stop_job(ctx, &job_id, signal).await;
        }
        other => warn!(function = other, "unknown queue function"),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::ops::Deref;
    use std::sync::Arc;

    use uwb_broker::MemoryBus;
    use uwb_core::config::ServiceConfig;
    use uwb_db::{SqliteJobStore, SqliteSettingsStore, setup_test_database};

    use crate::jobs::WorkerContext;

    /// A `WorkerContext` over temp directories, an in-memory SQLite store
    /// and the in-memory bus. Holds the tempdir guards alive.
    pub struct TestContext {
        ctx: WorkerContext,
        _workspace: tempfile::TempDir,
        _data: tempfile::TempDir,
    }

    impl Deref for TestContext {
        type Target = WorkerContext;
        fn deref(&self) -> &WorkerContext {
            &self.ctx
        }
    }

    pub async fn memory_context() -> TestContext {
        let workspace = tempfile::tempdir().expect("tempdir");
        let data = tempfile::tempdir().expect("tempdir");
        let config = ServiceConfig {
            workspace_root: workspace.path().to_path_buf(),
            out_dir: workspace.path().join("out"),
            data_dir: data.path().to_path_buf(),
            logs_dir: data.path().join("logs"),
            redis_url: String::new(),
            database_url: String::new(),
            bind_addr: String::new(),
            cors_origins: "*".into(),
            source_commit: "unknown".into(),
            repo_url_default: String::new(),
            repo_ref_default: String::new(),
        };
        let pool = setup_test_database().await.expect("schema");
        let ctx = WorkerContext::new(
            config,
            Arc::new(SqliteJobStore::new(pool.clone())),
            Arc::new(SqliteSettingsStore::new(pool)),
            Arc::new(MemoryBus::new()),
        );
        TestContext {
            ctx,
            _workspace: workspace,
            _data: data,
        }
    }
}
