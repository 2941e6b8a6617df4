//! Worker-side stop handler.
//!
//! Stop requests travel through the controls queue because only the worker
//! shares a pid namespace with the build child. The handler is idempotent:
//! terminal jobs are left alone, queued jobs are canceled in place, running
//! jobs get the requested signal delivered to their process group with a
//! confirmation wait before `canceled` is recorded.

use std::time::Duration;

use tracing::warn;

use uwb_core::job::{JobStatus, StopSignal};
use uwb_core::ports::JobFinish;

use crate::jobs::WorkerContext;

const LIVENESS_POLL: Duration = Duration::from_millis(500);

/// Cancel or signal one job. Safe to run concurrently with itself and with
/// the job starting up.
pub async fn run_stop_job(ctx: &WorkerContext, job_id: &str, signal: StopSignal) {
    let job = match ctx.jobs.get(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return,
        Err(error) => {
            warn!(job_id, %error, "job lookup failed");
            return;
        }
    };

    if job.status.is_terminal() {
        return;
    }

    if job.status == JobStatus::Queued {
        // Never spawned: cancel the row and (best effort) pull the item
        // back out of its queue.
        if let Some(queue_job_id) = job.queue_job_id.as_deref() {
            for queue in [uwb_broker::QUEUE_BUILDS, uwb_broker::QUEUE_CONTROLS] {
                if ctx.queue.remove_by_queue_job_id(queue, queue_job_id).await {
                    break;
                }
            }
        }
        let finish = JobFinish {
            status: JobStatus::Canceled,
            return_code: None,
            error: Some("Build canceled by user (queued job)".to_string()),
            artifact_path: None,
        };
        if let Err(error) = ctx.jobs.mark_finished(job_id, &finish).await {
            warn!(job_id, %error, "failed to cancel queued job");
        }
        return;
    }

    // status == running from here on
    let Some(pid) = job.process_pid else {
        let _ = ctx
            .jobs
            .set_error(
                job_id,
                "Stop requested by user, but build PID is missing. \
                 Please retry stop or check worker logs.",
            )
            .await;
        return;
    };

    #[cfg(unix)]
    {
        crate::supervisor::signal_process_group(pid, signal);

        // Confirm termination before marking canceled. If the group is
        // still alive after the window, the job stays running so the user
        // can retry (typically escalating to SIGKILL).
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(signal.confirm_timeout_secs());
        while tokio::time::Instant::now() < deadline {
            if !crate::supervisor::liveness::process_group_alive(pid) {
                break;
            }
            tokio::time::sleep(LIVENESS_POLL).await;
        }

        if crate::supervisor::liveness::process_group_alive(pid) {
            let _ = ctx
                .jobs
                .set_error(
                    job_id,
                    &format!(
                        "Stop requested by user ({}), but process is still running. \
                         Retry stop if needed.",
                        signal.as_str().to_uppercase()
                    ),
                )
                .await;
            return;
        }

        let finish = JobFinish {
            status: JobStatus::Canceled,
            return_code: None,
            error: Some(format!(
                "Build canceled by user ({})",
                signal.as_str().to_uppercase()
            )),
            artifact_path: None,
        };
        if let Err(error) = ctx.jobs.mark_finished(job_id, &finish).await {
            warn!(job_id, %error, "failed to record cancelation");
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        let _ = ctx
            .jobs
            .set_error(job_id, "Stop is only supported on unix hosts")
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::test_support::memory_context;
    use serde_json::json;
    use uwb_core::job::JobRecord;

    #[tokio::test]
    async fn terminal_job_is_left_alone() {
        let ctx = memory_context().await;
        let job = JobRecord::new_build("b0s", "abc");
        ctx.jobs.insert(&job).await.unwrap();
        ctx.jobs.mark_running(&job.id, "/l.log").await.unwrap();
        ctx.jobs
            .mark_finished(&job.id, &JobFinish::new(JobStatus::Succeeded))
            .await
            .unwrap();

        run_stop_job(&ctx, &job.id, StopSignal::Sigterm).await;

        let loaded = ctx.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn queued_job_is_canceled_and_dequeued() {
        let ctx = memory_context().await;
        let job = JobRecord::new_build("b0s", "abc");
        ctx.jobs.insert(&job).await.unwrap();

        let item = ctx
            .queue
            .enqueue(uwb_broker::QUEUE_BUILDS, "build", json!({"job_id": job.id}))
            .await
            .unwrap();
        ctx.jobs.set_queue_job_id(&job.id, &item.queue_job_id).await.unwrap();

        run_stop_job(&ctx, &job.id, StopSignal::Sigterm).await;

        let loaded = ctx.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Canceled);
        assert_eq!(
            loaded.error.as_deref(),
            Some("Build canceled by user (queued job)")
        );
        assert!(ctx.queue.pop(uwb_broker::QUEUE_BUILDS, 0).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn running_job_without_pid_keeps_running_with_guidance() {
        let ctx = memory_context().await;
        let job = JobRecord::new_build("b0s", "abc");
        ctx.jobs.insert(&job).await.unwrap();
        ctx.jobs.mark_running(&job.id, "/l.log").await.unwrap();

        run_stop_job(&ctx, &job.id, StopSignal::Sigterm).await;

        let loaded = ctx.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert!(loaded.error.unwrap().contains("PID is missing"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn running_job_with_dead_pid_is_canceled() {
        let ctx = memory_context().await;
        let job = JobRecord::new_build("b0s", "abc");
        ctx.jobs.insert(&job).await.unwrap();
        ctx.jobs.mark_running(&job.id, "/l.log").await.unwrap();
        // A pid that cannot exist: the group probe reports it dead.
        ctx.jobs.set_process_pid(&job.id, Some(9_999_992)).await.unwrap();

        run_stop_job(&ctx, &job.id, StopSignal::Sigkill).await;

        let loaded = ctx.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Canceled);
        assert_eq!(
            loaded.error.as_deref(),
            Some("Build canceled by user (SIGKILL)")
        );
        assert!(loaded.process_pid.is_none());
    }
}
