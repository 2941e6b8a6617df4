//! The build job: stage per-build overrides, run `make_rom.sh` under the
//! supervisor, resolve the terminal status and tear every override back down.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use uwb_core::debloat::{self, DebloatPatch};
use uwb_core::ff::{self, FfPatch};
use uwb_core::job::{JobRecord, JobStatus};
use uwb_core::mods::{self, ModOverrideState};
use uwb_core::ports::JobFinish;
use uwb_core::workspace::firmware_key_from_value;

use crate::archive::validate_mods_archive;
use crate::jobs::{WorkerContext, shell_quote};
use crate::supervisor::ShellJob;
use crate::tracker::FirmwareProgressTracker;

/// Filesystem changes staged for one build, undone after the supervisor
/// returns no matter how the build ended.
#[derive(Default)]
struct StagedOverrides {
    applied_mod_dirs: Vec<PathBuf>,
    staging_dir: Option<PathBuf>,
    debloat_patch: Option<DebloatPatch>,
    mods_state: Option<ModOverrideState>,
    ff_patch: Option<FfPatch>,
}

impl StagedOverrides {
    fn teardown(&self) {
        for dir in &self.applied_mod_dirs {
            let _ = std::fs::remove_dir_all(dir);
        }
        if let Some(dir) = &self.staging_dir {
            let _ = std::fs::remove_dir_all(dir);
        }
        if let Some(patch) = &self.debloat_patch {
            debloat::restore_debloat_file(patch);
        }
        if let Some(state) = &self.mods_state {
            mods::restore_mods_overrides(state);
        }
        if let Some(patch) = &self.ff_patch {
            ff::restore_ff_overrides(patch);
        }
    }
}

fn parse_list(json: Option<&String>) -> Vec<String> {
    json.and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

/// Copy validated extra-mod modules into `unica/mods` as `.uploaded-*`
/// override directories for the duration of this build.
fn stage_extra_mods(
    ctx: &WorkerContext,
    job: &JobRecord,
    archive_path: &Path,
    staged: &mut StagedOverrides,
) -> Result<()> {
    let staging_dir = ctx.config.tmp_extra_mods_dir().join(&job.id);
    std::fs::create_dir_all(&staging_dir)?;
    staged.staging_dir = Some(staging_dir.clone());

    let validated = validate_mods_archive(archive_path, &staging_dir)
        .context("uploaded mods archive failed validation")?;

    let target_mods_dir = ctx.config.workspace_root.join("unica/mods");
    std::fs::create_dir_all(&target_mods_dir)?;
    let short_id = &job.id[..job.id.len().min(8)];

    let mut module_dirs: Vec<PathBuf> = std::fs::read_dir(&validated.modules_root)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir() && p.join("module.prop").is_file())
        .collect();
    module_dirs.sort();

    for module_dir in module_dirs {
        let name = module_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dst = target_mods_dir.join(format!(".uploaded-{short_id}-{name}"));
        if dst.exists() {
            std::fs::remove_dir_all(&dst)?;
        }
        copy_dir(&module_dir, &dst)?;
        staged.applied_mod_dirs.push(dst);
    }
    Ok(())
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Newest `UN1CA_*.zip` under the out tree.
fn find_latest_artifact(out_dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(out_dir).ok()?;
    entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name().is_some_and(|n| {
                    let name = n.to_string_lossy();
                    name.starts_with("UN1CA_") && name.ends_with(".zip")
                })
        })
        .max_by_key(|p| {
            p.metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH)
        })
}

fn build_script(job: &JobRecord, workspace_root: &Path, flags: &[String]) -> String {
    let short_commit: String = job.source_commit.chars().take(8).collect();
    let version_suffix = job.version_suffix.as_deref().unwrap_or("").trim();

    let mut exports = Vec::new();
    if let Some(fw) = job.source_firmware.as_deref().filter(|v| !v.is_empty()) {
        exports.push(format!("export SOURCE_FIRMWARE={}", shell_quote(fw)));
    }
    if let Some(fw) = job.target_firmware.as_deref().filter(|v| !v.is_empty()) {
        exports.push(format!("export TARGET_FIRMWARE={}", shell_quote(fw)));
    }
    if let (Some(major), Some(minor), Some(patch)) =
        (job.version_major, job.version_minor, job.version_patch)
    {
        let mut rom_version = format!("{major}.{minor}.{patch}-{short_commit}");
        if !version_suffix.is_empty() {
            rom_version.push('-');
            rom_version.push_str(version_suffix);
        }
        exports.push(format!("export ROM_VERSION={}", shell_quote(&rom_version)));
    }

    let mut script = format!(
        "cd {} && source buildenv.sh {} && ",
        shell_quote(&workspace_root.to_string_lossy()),
        shell_quote(&job.target)
    );
    if !exports.is_empty() {
        script.push_str(&exports.join(" && "));
        script.push_str(" && ");
    }
    script.push_str("scripts/make_rom.sh");
    for flag in flags {
        script.push(' ');
        script.push_str(flag);
    }
    script
}

/// Execute one build job end to end. All failures are captured into the job
/// row; this function itself never bubbles an error to the worker loop.
pub async fn run_build_job(ctx: &WorkerContext, job_id: &str) {
    let job = match ctx.jobs.get(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return,
        Err(error) => {
            warn!(job_id, %error, "job lookup failed");
            return;
        }
    };

    let log_path = ctx.log_path(&job.target, &job.id);
    match ctx.jobs.mark_running(job_id, &log_path.to_string_lossy()).await {
        Ok(true) => {}
        Ok(false) => {
            info!(job_id, "skipping job no longer in queued state");
            return;
        }
        Err(error) => {
            warn!(job_id, %error, "running transition failed");
            return;
        }
    }

    let mut staged = StagedOverrides::default();
    let outcome = execute(ctx, &job, &log_path, &mut staged).await;
    staged.teardown();

    // The reuse decision never consults the archive again; drop it.
    if let Some(archive) = job.extra_mods_archive_path.as_deref() {
        let _ = std::fs::remove_file(archive);
    }

    let finish = match outcome {
        Ok(0) => {
            let artifact = if job.no_rom_zip {
                None
            } else {
                find_latest_artifact(&ctx.config.out_dir)
                    .map(|p| p.to_string_lossy().into_owned())
            };
            JobFinish {
                status: JobStatus::Succeeded,
                return_code: Some(0),
                error: None,
                artifact_path: artifact,
            }
        }
        Ok(rc) => JobFinish {
            status: JobStatus::Failed,
            return_code: Some(rc),
            error: Some(format!("Build failed with return code {rc}")),
            artifact_path: None,
        },
        Err(error) => JobFinish {
            status: JobStatus::Failed,
            return_code: Some(1),
            error: Some(error.to_string()),
            artifact_path: None,
        },
    };

    // mark_finished keeps `canceled` set by the stopper: terminal wins.
    if let Err(error) = ctx.jobs.mark_finished(job_id, &finish).await {
        warn!(job_id, %error, "failed to persist terminal status");
    }
}

async fn execute(
    ctx: &WorkerContext,
    job: &JobRecord,
    log_path: &Path,
    staged: &mut StagedOverrides,
) -> Result<i64> {
    let root = ctx.config.workspace_root.clone();
    let mut flags: Vec<String> = Vec::new();
    if job.force {
        flags.push("--force".to_string());
    }
    if job.no_rom_zip {
        flags.push("--no-rom-zip".to_string());
    }
    let mut force_needed = false;

    if let Some(archive) = job.extra_mods_archive_path.as_deref() {
        let archive = Path::new(archive);
        if archive.exists() {
            stage_extra_mods(ctx, job, archive, staged)?;
            force_needed = true;
        }
    }

    let mods_disabled = parse_list(job.mods_disabled_json.as_ref());
    if !mods_disabled.is_empty() {
        staged.mods_state = mods::apply_mods_disabled_overrides(&root, &mods_disabled);
        force_needed = force_needed || staged.mods_state.is_some();
    }

    let debloat_disabled = parse_list(job.debloat_disabled_json.as_ref());
    let add_system = parse_list(job.debloat_add_system_json.as_ref());
    let add_product = parse_list(job.debloat_add_product_json.as_ref());
    staged.debloat_patch =
        debloat::apply_debloat_overrides(&root, &debloat_disabled, &add_system, &add_product)?;
    force_needed = force_needed || staged.debloat_patch.is_some();

    if let Some(raw) = job.ff_overrides_json.as_deref() {
        if let Ok(overrides) = serde_json::from_str(raw) {
            let xml = root.join("target").join(&job.target).join("floating_feature.xml");
            staged.ff_patch = ff::apply_ff_overrides(&xml, &overrides)?;
            force_needed = force_needed || staged.ff_patch.is_some();
        }
    }

    if force_needed && !flags.iter().any(|f| f == "--force") {
        flags.push("--force".to_string());
    }

    let script = build_script(job, &root, &flags);
    let shell = ShellJob::new(script, log_path);
    let running = shell.spawn().await.context("failed to spawn build shell")?;
    ctx.jobs.set_process_pid(&job.id, Some(running.pid())).await?;

    let mut tracker = FirmwareProgressTracker::for_build(
        ctx.firmware_progress.clone(),
        ctx.build_progress.clone(),
        job.id.clone(),
        vec![
            firmware_key_from_value(job.source_firmware.as_deref().unwrap_or("")),
            firmware_key_from_value(job.target_firmware.as_deref().unwrap_or("")),
        ],
    );

    let streamed = running.stream(&mut tracker).await;
    // Pid and progress teardown happen on every exit path.
    ctx.jobs.set_process_pid(&job.id, None).await?;
    match streamed {
        Ok(rc) => {
            tracker.finalize(rc == 0).await;
            Ok(rc)
        }
        Err(error) => {
            tracker.finalize(false).await;
            bail!("build output streaming failed: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uwb_core::job::JobRecord;

    #[test]
    fn script_includes_overrides_and_flags() {
        let mut job = JobRecord::new_build("b0s", "abc1234def");
        job.source_firmware = Some("SM-S901B/EUX/S901BXXU9FYA1".into());
        job.target_firmware = Some("SM-S911B/EUX/S911BXXU5DYA4".into());
        job.version_major = Some(4);
        job.version_minor = Some(1);
        job.version_patch = Some(0);
        job.version_suffix = Some("beta".into());

        let script = build_script(
            &job,
            Path::new("/workspace"),
            &["--force".to_string(), "--no-rom-zip".to_string()],
        );
        assert!(script.starts_with("cd '/workspace' && source buildenv.sh 'b0s' && "));
        assert!(script.contains("export SOURCE_FIRMWARE='SM-S901B/EUX/S901BXXU9FYA1'"));
        assert!(script.contains("export ROM_VERSION='4.1.0-abc1234d-beta'"));
        assert!(script.ends_with("scripts/make_rom.sh --force --no-rom-zip"));
    }

    #[test]
    fn script_omits_absent_overrides() {
        let job = JobRecord::new_build("b0s", "unknown");
        let script = build_script(&job, Path::new("/workspace"), &[]);
        assert!(!script.contains("export SOURCE_FIRMWARE"));
        assert!(!script.contains("export ROM_VERSION"));
        assert!(script.ends_with("scripts/make_rom.sh"));
    }

    #[test]
    fn latest_artifact_picks_newest_zip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("UN1CA_old.zip"), "a").unwrap();
        std::fs::write(dir.path().join("not-a-rom.txt"), "b").unwrap();
        let newest = dir.path().join("UN1CA_new.zip");
        std::fs::write(&newest, "c").unwrap();
        let old_time = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        let file = std::fs::File::open(dir.path().join("UN1CA_old.zip")).unwrap();
        file.set_modified(old_time).unwrap();

        assert_eq!(find_latest_artifact(dir.path()).unwrap(), newest);
        assert!(find_latest_artifact(&dir.path().join("missing")).is_none());
    }
}
