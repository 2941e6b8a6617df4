//! Operation jobs: the shared status-lifecycle wrapper plus the firmware
//! extract and delete handlers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use uwb_core::job::JobStatus;
use uwb_core::ports::JobFinish;
use uwb_core::progress::ProgressPhase;

use crate::jobs::{WorkerContext, shell_quote};
use crate::supervisor::ShellJob;
use crate::tracker::FirmwareProgressTracker;

/// Placeholder version component accepted by `extract_fw.sh` when only the
/// cached Odin image matters.
const ANY_VERSION: &str = "350000000000000";

/// Status-lifecycle wrapper shared by all operation jobs: `queued` ->
/// `running` -> `succeeded`/`failed`, with the error captured into the row.
/// A job canceled while waiting is skipped.
pub async fn run_operation_job<F, Fut>(ctx: &WorkerContext, job_id: &str, operation: F)
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let job = match ctx.jobs.get(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return,
        Err(error) => {
            warn!(job_id, %error, "job lookup failed");
            return;
        }
    };

    let name = job.operation_name.as_deref().unwrap_or("operation");
    let log_path = ctx.log_path(name, &job.id);
    match ctx.jobs.mark_running(job_id, &log_path.to_string_lossy()).await {
        Ok(true) => {}
        Ok(false) => {
            info!(job_id, "skipping operation no longer in queued state");
            return;
        }
        Err(error) => {
            warn!(job_id, %error, "running transition failed");
            return;
        }
    }

    let finish = match operation(log_path).await {
        Ok(()) => JobFinish {
            status: JobStatus::Succeeded,
            return_code: Some(0),
            error: None,
            artifact_path: None,
        },
        Err(error) => JobFinish {
            status: JobStatus::Failed,
            return_code: Some(1),
            error: Some(error.to_string()),
            artifact_path: None,
        },
    };
    if let Err(error) = ctx.jobs.mark_finished(job_id, &finish).await {
        warn!(job_id, %error, "failed to persist terminal status");
    }
}

/// Extract firmware from the Odin cache into `out/fw`, always forced for a
/// consistent result.
pub async fn run_extract_fw_job(
    ctx: &WorkerContext,
    job_id: &str,
    fw_key: &str,
    target_codename: &str,
) {
    let ctx_ref = ctx;
    let job_id_owned = job_id.to_string();
    let fw_key = fw_key.to_string();
    let target = target_codename.to_string();

    run_operation_job(ctx, job_id, move |log_path| async move {
        let Some((model, csc)) = fw_key.split_once('_') else {
            bail!("Invalid fw key: {fw_key}");
        };
        if model.is_empty() || csc.is_empty() {
            bail!("Invalid fw key: {fw_key}");
        }
        let firmware = format!("{model}/{csc}/{ANY_VERSION}");

        tokio::fs::create_dir_all(log_path.parent().unwrap_or(Path::new("."))).await?;
        tokio::fs::write(
            &log_path,
            format!("[extract] fw_key={fw_key} target={target}\n"),
        )
        .await?;

        let script = format!(
            "cd {} && source buildenv.sh {} && scripts/extract_fw.sh --ignore-source --ignore-target --force {}",
            shell_quote(&ctx_ref.config.workspace_root.to_string_lossy()),
            shell_quote(&target),
            shell_quote(&firmware)
        );

        let mut tracker = FirmwareProgressTracker::new(
            ctx_ref.firmware_progress.clone(),
            job_id_owned.clone(),
            vec![fw_key.to_uppercase()],
            ProgressPhase::Extract,
        );
        tracker.emit_heartbeat().await;

        let running = ShellJob::new(script, &log_path)
            .spawn()
            .await
            .context("failed to spawn extract shell")?;
        ctx_ref
            .jobs
            .set_process_pid(&job_id_owned, Some(running.pid()))
            .await?;

        let streamed = running.stream(&mut tracker).await;
        ctx_ref.jobs.set_process_pid(&job_id_owned, None).await?;

        match streamed {
            Ok(0) => {
                tracker.finalize(true).await;
                Ok(())
            }
            Ok(rc) => {
                tracker.finalize(false).await;
                bail!("extract_fw.sh failed with return code {rc}")
            }
            Err(error) => {
                tracker.finalize(false).await;
                bail!("extract output streaming failed: {error}")
            }
        }
    })
    .await;
}

/// Delete a cached Odin or extracted firmware entry from the out tree.
pub async fn run_delete_fw_job(ctx: &WorkerContext, job_id: &str, fw_type: &str, fw_key: &str) {
    let base = ctx
        .config
        .out_dir
        .join(if fw_type == "odin" { "odin" } else { "fw" });
    let target = base.join(fw_key);
    let fw_type = fw_type.to_string();
    let fw_key_owned = fw_key.to_string();
    let firmware_progress = ctx.firmware_progress.clone();

    run_operation_job(ctx, job_id, move |log_path| async move {
        let mut log = format!("[delete] fw_type={fw_type} fw_key={fw_key_owned}\n");

        if !target.exists() {
            log.push_str("[delete] path does not exist, nothing to do\n");
        } else if target.is_dir() {
            std::fs::remove_dir_all(&target)
                .with_context(|| format!("removing {}", target.display()))?;
            log.push_str(&format!("[delete] removed directory: {}\n", target.display()));
        } else {
            std::fs::remove_file(&target)
                .with_context(|| format!("removing {}", target.display()))?;
            log.push_str(&format!("[delete] removed file: {}\n", target.display()));
        }

        // The progress card for this key no longer has a backing entry.
        firmware_progress.remove(&fw_key_owned.to_uppercase()).await;

        tokio::fs::create_dir_all(log_path.parent().unwrap_or(Path::new("."))).await?;
        tokio::fs::write(&log_path, log).await?;
        Ok(())
    })
    .await;
}
