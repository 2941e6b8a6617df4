//! Repo operation jobs: clone, pull, submodule sync and delete. All run
//! through the operation lifecycle wrapper and publish into the single-slot
//! repo progress stream with caller-set stages.

use std::path::Path;

use anyhow::{Context, Result, bail};

use uwb_core::progress::RepoStage;

use crate::git::repo_root_dir;
use crate::jobs::{WorkerContext, shell_quote};
use crate::jobs::operation::run_operation_job;
use crate::supervisor::ShellJob;
use crate::tracker::RepoCommandConsumer;

/// Run one supervised shell phase of a repo operation, publishing per-line
/// progress under the given stage/title.
async fn stream_repo_phase(
    ctx: &WorkerContext,
    job_id: &str,
    script: String,
    log_path: &Path,
    stage: RepoStage,
    title: &str,
) -> Result<i64> {
    let mut consumer = RepoCommandConsumer::new(ctx.repo_progress.clone(), stage, title);
    consumer.start().await;

    let running = ShellJob::new(script, log_path)
        .spawn()
        .await
        .context("failed to spawn repo shell")?;
    ctx.jobs.set_process_pid(job_id, Some(running.pid())).await?;
    let streamed = running.stream(&mut consumer).await;
    ctx.jobs.set_process_pid(job_id, None).await?;
    Ok(streamed?)
}

/// Checkout + reset + submodule refresh, shared between clone and pull.
fn checkout_script(repo_dir: &Path, git_ref: &str, with_submodules: bool) -> String {
    let dir = shell_quote(&repo_dir.to_string_lossy());
    let reference = shell_quote(git_ref);
    let mut script = format!(
        "cd {dir} && \
         git -c safe.directory=* fetch --all --tags --prune && \
         git -c safe.directory=* fetch origin {reference} --prune || true && \
         git -c safe.directory=* checkout -f {reference} && \
         if git -c safe.directory=* rev-parse --verify origin/{reference} >/dev/null 2>&1; then \
         git -c safe.directory=* reset --hard origin/{reference}; fi"
    );
    if with_submodules {
        script.push_str(
            " && git -c safe.directory=* submodule sync --recursive \
             && git -c safe.directory=* submodule update --init --recursive --jobs 8",
        );
    }
    script
}

/// Clone the build tree, preserving any existing `out/` across the wipe.
pub async fn run_repo_clone_job(ctx: &WorkerContext, job_id: &str, git_url: &str, git_ref: &str) {
    let git_url = git_url.to_string();
    let git_ref = git_ref.to_string();

    run_operation_job(ctx, job_id, move |log_path| async move {
        let repo_dir = repo_root_dir(&ctx.config);
        ctx.repo_progress.clear().await;

        // Keep out/ (cached firmware, artifacts) out of the way of the wipe.
        let keep_out_src = repo_dir.join("out");
        let keep_out_tmp = ctx
            .config
            .data_dir
            .join("tmp-repo-ops")
            .join(format!("{job_id}-out"));
        if keep_out_src.exists() {
            if let Some(parent) = keep_out_tmp.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if keep_out_tmp.exists() {
                std::fs::remove_dir_all(&keep_out_tmp)?;
            }
            std::fs::rename(&keep_out_src, &keep_out_tmp)?;
        }
        if repo_dir.exists() {
            std::fs::remove_dir_all(&repo_dir)?;
        }
        std::fs::create_dir_all(&repo_dir)?;

        let clone_script = format!(
            "git clone --progress --recurse-submodules {} {}",
            shell_quote(&git_url),
            shell_quote(&repo_dir.to_string_lossy())
        );
        let rc = stream_repo_phase(
            ctx,
            job_id,
            clone_script,
            &log_path,
            RepoStage::Clone,
            &format!("Clone {git_url}"),
        )
        .await?;
        if rc != 0 {
            bail!("git clone failed with return code {rc}");
        }

        let rc = stream_repo_phase(
            ctx,
            job_id,
            checkout_script(&repo_dir, &git_ref, true),
            &log_path,
            RepoStage::Submodules,
            &format!("Checkout {git_ref} and sync submodules"),
        )
        .await?;
        if rc != 0 {
            bail!("checkout/submodule sync failed with return code {rc}");
        }

        if keep_out_tmp.exists() {
            let dst_out = repo_dir.join("out");
            if dst_out.exists() {
                std::fs::remove_dir_all(&dst_out)?;
            }
            std::fs::rename(&keep_out_tmp, &dst_out)?;
        }

        RepoCommandConsumer::complete(
            &ctx.repo_progress,
            RepoStage::Clone,
            "Repository clone completed",
        )
        .await;
        Ok(())
    })
    .await;
}

/// Update the checkout to the requested ref.
pub async fn run_repo_pull_job(ctx: &WorkerContext, job_id: &str, git_ref: &str) {
    let git_ref = git_ref.to_string();

    run_operation_job(ctx, job_id, move |log_path| async move {
        let root = repo_root_dir(&ctx.config);
        if !root.join(".git").is_dir() {
            bail!("Repository is not cloned yet");
        }
        ctx.repo_progress.clear().await;

        let rc = stream_repo_phase(
            ctx,
            job_id,
            checkout_script(&root, &git_ref, false),
            &log_path,
            RepoStage::Pull,
            &format!("Update repository ({git_ref})"),
        )
        .await?;
        if rc != 0 {
            bail!("repository update failed with return code {rc}");
        }

        RepoCommandConsumer::complete(&ctx.repo_progress, RepoStage::Pull, "Repository updated")
            .await;
        Ok(())
    })
    .await;
}

/// Sync and update submodules of the existing checkout.
pub async fn run_repo_submodules_job(ctx: &WorkerContext, job_id: &str) {
    run_operation_job(ctx, job_id, move |log_path| async move {
        let root = repo_root_dir(&ctx.config);
        if !root.join(".git").is_dir() {
            bail!("Repository is not cloned yet");
        }
        ctx.repo_progress.clear().await;

        let script = format!(
            "cd {} && git -c safe.directory=* submodule sync --recursive \
             && git -c safe.directory=* submodule update --init --recursive --jobs 8",
            shell_quote(&root.to_string_lossy())
        );
        let rc = stream_repo_phase(
            ctx,
            job_id,
            script,
            &log_path,
            RepoStage::Submodules,
            "Update submodules",
        )
        .await?;
        if rc != 0 {
            bail!("submodule update failed with return code {rc}");
        }

        RepoCommandConsumer::complete(
            &ctx.repo_progress,
            RepoStage::Submodules,
            "Submodules updated",
        )
        .await;
        Ok(())
    })
    .await;
}

/// Remove the checkout; `repo_only` preserves `out/`.
pub async fn run_repo_delete_job(ctx: &WorkerContext, job_id: &str, mode: &str) {
    let mode = mode.to_string();

    run_operation_job(ctx, job_id, move |log_path| async move {
        let root = repo_root_dir(&ctx.config);
        ctx.repo_progress.clear().await;

        let mut log = format!("[repo-delete] mode={mode} path={}\n", root.display());
        if root.exists() {
            if mode == "repo_with_out" {
                std::fs::remove_dir_all(&root)?;
                std::fs::create_dir_all(&root)?;
            } else {
                for entry in std::fs::read_dir(&root)?.filter_map(Result::ok) {
                    if entry.file_name() == "out" {
                        continue;
                    }
                    let path = entry.path();
                    if path.is_dir() {
                        std::fs::remove_dir_all(&path)?;
                    } else {
                        std::fs::remove_file(&path)?;
                    }
                }
            }
            log.push_str("[repo-delete] done\n");
        } else {
            log.push_str("[repo-delete] path does not exist, nothing to do\n");
        }
        tokio::fs::create_dir_all(log_path.parent().unwrap_or(Path::new("."))).await?;
        tokio::fs::write(&log_path, log).await?;

        let title = if mode == "repo_with_out" {
            "Repository removed with out"
        } else {
            "Repository removed, out preserved"
        };
        RepoCommandConsumer::complete(&ctx.repo_progress, RepoStage::Delete, title).await;
        Ok(())
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::test_support::memory_context;
    use uwb_core::job::{JobRecord, JobStatus};

    #[test]
    fn checkout_script_shape() {
        let script = checkout_script(Path::new("/workspace"), "sixteen", true);
        assert!(script.contains("checkout -f 'sixteen'"));
        assert!(script.contains("reset --hard origin/'sixteen'"));
        assert!(script.contains("submodule update --init --recursive --jobs 8"));

        let no_subs = checkout_script(Path::new("/workspace"), "sixteen", false);
        assert!(!no_subs.contains("submodule"));
    }

    #[tokio::test]
    async fn delete_preserves_out_in_repo_only_mode() {
        let ctx = memory_context().await;
        let root = repo_root_dir(&ctx.config);
        std::fs::create_dir_all(root.join("unica")).unwrap();
        std::fs::create_dir_all(root.join("out/odin")).unwrap();
        std::fs::write(root.join("README.md"), "x").unwrap();

        let job = JobRecord::new_operation("b0s", "abc", "Delete repository");
        ctx.jobs.insert(&job).await.unwrap();
        run_repo_delete_job(&ctx, &job.id, "repo_only").await;

        assert!(root.join("out/odin").exists());
        assert!(!root.join("unica").exists());
        assert!(!root.join("README.md").exists());

        let loaded = ctx.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Succeeded);

        let slot = ctx.repo_progress.get().await.unwrap();
        assert_eq!(slot["stage"], "delete");
        assert_eq!(slot["status"], "completed");
    }

    #[tokio::test]
    async fn pull_without_checkout_fails_cleanly() {
        let ctx = memory_context().await;
        let job = JobRecord::new_operation("b0s", "abc", "Update repository");
        ctx.jobs.insert(&job).await.unwrap();

        run_repo_pull_job(&ctx, &job.id, "sixteen").await;

        let loaded = ctx.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert!(loaded.error.unwrap().contains("not cloned"));
    }
}
