//! Job endpoints: request materialization, listing, stop, artifact download
//! and log hints.

use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::Path;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::header;
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use uwb_broker::QUEUE_BUILDS;
use uwb_core::hints::{HINT_TAIL_BYTES, detect_build_hints};
use uwb_core::job::{BuildJobRequest, JobRecord, JobStatus, StopSignal};
use uwb_core::signature::{BuildSignatureInputs, build_signature, payload_digest};
use uwb_core::{debloat, ff, mods, workspace};
use uwb_runtime::jobs::functions;

use crate::error::HttpError;
use crate::handlers::meta::resolve_root;
use crate::state::AppState;
use crate::uploads;

const MAX_LIST_LIMIT: u32 = 200;

/// Trim, dedupe and validate a debloat path list: plain partition-relative
/// paths, no newlines or double quotes.
fn normalize_path_list(values: Option<&Vec<String>>) -> Result<Vec<String>, HttpError> {
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    for raw in values.into_iter().flatten() {
        let item = raw.trim();
        if item.is_empty() || seen.contains(item) {
            continue;
        }
        if item.contains('\n') || item.contains('\r') || item.contains('"') {
            return Err(HttpError::bad_request(format!("Invalid debloat path: {item:?}")));
        }
        seen.insert(item.to_string());
        out.push(item.to_string());
    }
    Ok(out)
}

/// `POST /jobs`: defaults merge -> validation -> signature -> reuse or a
/// fresh queued job.
pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<BuildJobRequest>,
) -> Result<Json<JobRecord>, HttpError> {
    let config = &state.worker.config;
    let root = resolve_root(&state);
    let source_commit =
        uwb_runtime::git::resolve_source_commit(root.as_deref(), config).await;

    let Some(root) = root else {
        return Err(HttpError::bad_request("Unknown target"));
    };
    let targets = workspace::target_codenames(&root);
    if !targets.contains(&payload.target) {
        return Err(HttpError::bad_request("Unknown target"));
    }

    let defaults = workspace::defaults_for_target(&root, &payload.target);
    let source_firmware = payload
        .source_firmware
        .clone()
        .filter(|v| !v.is_empty())
        .unwrap_or(defaults.source_firmware);
    let target_firmware = payload
        .target_firmware
        .clone()
        .filter(|v| !v.is_empty())
        .unwrap_or(defaults.target_firmware);
    let version_major = payload.version_major.unwrap_or(defaults.version_major);
    let version_minor = payload.version_minor.unwrap_or(defaults.version_minor);
    let version_patch = payload.version_patch.unwrap_or(defaults.version_patch);
    let version_suffix = payload
        .version_suffix
        .clone()
        .unwrap_or(defaults.version_suffix)
        .trim()
        .to_string();

    // Uploaded extra-mods archive: single use, file must still exist.
    let mut extra_mods_archive_path = None;
    let mut extra_mods_modules_json = None;
    let mut extra_mods_digest = String::new();
    if let Some(upload_id) = payload.extra_mods_upload_id.as_deref() {
        let mut meta = uploads::load_meta(&config.data_dir, upload_id)
            .await
            .ok_or_else(|| HttpError::bad_request("Invalid extra_mods_upload_id"))?;
        if meta.used {
            return Err(HttpError::bad_request(
                "This uploaded mods archive has already been used",
            ));
        }
        if !Path::new(&meta.archive_path).exists() {
            return Err(HttpError::bad_request("Uploaded mods archive file is missing"));
        }
        meta.used = true;
        uploads::save_meta(&config.data_dir, upload_id, &meta)
            .await
            .map_err(|e| HttpError::Internal(e.to_string()))?;

        let modules_json = serde_json::to_string(&meta.modules)
            .map_err(|e| HttpError::Internal(e.to_string()))?;
        extra_mods_digest = payload_digest(&modules_json);
        extra_mods_archive_path = Some(meta.archive_path.clone());
        extra_mods_modules_json = Some(modules_json);
    }

    // Mods disable list: every id must exist in the on-disk catalog.
    let mods_disabled: BTreeSet<String> = payload
        .mods_disabled
        .iter()
        .flatten()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if !mods_disabled.is_empty() {
        let catalog: BTreeSet<String> = mods::parse_mod_entries(&root)
            .into_iter()
            .map(|e| e.id)
            .collect();
        let unknown: Vec<&str> = mods_disabled
            .iter()
            .filter(|id| !catalog.contains(*id))
            .map(String::as_str)
            .take(5)
            .collect();
        if !unknown.is_empty() {
            return Err(HttpError::bad_request(format!(
                "Unknown mod ids: {}",
                unknown.join(", ")
            )));
        }
    }
    let mods_disabled_json = serde_json::to_string(&mods_disabled)
        .map_err(|e| HttpError::Internal(e.to_string()))?;

    // Debloat overrides: ids against the parsed catalog, added paths
    // character-checked.
    let debloat_disabled: BTreeSet<String> = payload
        .debloat_disabled
        .iter()
        .flatten()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if !debloat_disabled.is_empty() {
        let catalog: BTreeSet<String> = debloat::parse_debloat_entries(&root)
            .into_iter()
            .map(|e| e.id)
            .collect();
        let unknown: Vec<&str> = debloat_disabled
            .iter()
            .filter(|id| !catalog.contains(*id))
            .map(String::as_str)
            .take(5)
            .collect();
        if !unknown.is_empty() {
            return Err(HttpError::bad_request(format!(
                "Unknown debloat ids: {}",
                unknown.join(", ")
            )));
        }
    }
    let debloat_add_system = normalize_path_list(payload.debloat_add_system.as_ref())?;
    let debloat_add_product = normalize_path_list(payload.debloat_add_product.as_ref())?;
    let debloat_disabled_json = serde_json::to_string(&debloat_disabled)
        .map_err(|e| HttpError::Internal(e.to_string()))?;
    let debloat_add_system_json = serde_json::to_string(&debloat_add_system)
        .map_err(|e| HttpError::Internal(e.to_string()))?;
    let debloat_add_product_json = serde_json::to_string(&debloat_add_product)
        .map_err(|e| HttpError::Internal(e.to_string()))?;

    // Floating-feature overrides: well-formed keys that exist in the merged
    // defaults for this target.
    let ff_overrides = payload.ff_overrides.clone().unwrap_or_default();
    if !ff_overrides.is_empty() {
        let known = ff::ff_defaults_for_target(&root, &payload.target);
        for key in ff_overrides.keys() {
            if !ff::is_ff_key(key) {
                return Err(HttpError::bad_request(format!(
                    "Invalid floating feature key: {key}"
                )));
            }
            if !known.contains_key(key) {
                return Err(HttpError::bad_request(format!(
                    "Unknown floating feature key: {key}"
                )));
            }
        }
    }
    let ff_overrides_json = serde_json::to_string(&ff_overrides)
        .map_err(|e| HttpError::Internal(e.to_string()))?;

    let signature = build_signature(&BuildSignatureInputs {
        target: payload.target.clone(),
        source_commit: source_commit.clone(),
        source_firmware: source_firmware.clone(),
        target_firmware: target_firmware.clone(),
        version_major,
        version_minor,
        version_patch,
        version_suffix: version_suffix.clone(),
        extra_mods_digest,
        mods_disabled_digest: payload_digest(&mods_disabled_json),
        debloat_disabled_digest: payload_digest(&debloat_disabled_json),
        debloat_add_system_digest: payload_digest(&debloat_add_system_json),
        debloat_add_product_digest: payload_digest(&debloat_add_product_json),
        ff_overrides_digest: payload_digest(&ff_overrides_json),
    });

    let mut job = JobRecord::new_build(&payload.target, &source_commit);
    job.source_firmware = Some(source_firmware);
    job.target_firmware = Some(target_firmware);
    job.version_major = Some(version_major);
    job.version_minor = Some(version_minor);
    job.version_patch = Some(version_patch);
    job.version_suffix = Some(version_suffix);
    job.build_signature = Some(signature.clone());
    job.force = payload.force;
    job.no_rom_zip = payload.no_rom_zip;
    job.extra_mods_modules_json = extra_mods_modules_json;
    job.mods_disabled_json = Some(mods_disabled_json);
    job.debloat_disabled_json = Some(debloat_disabled_json);
    job.debloat_add_system_json = Some(debloat_add_system_json);
    job.debloat_add_product_json = Some(debloat_add_product_json);
    job.ff_overrides_json = Some(ff_overrides_json);

    // Reuse a finished artifact for the same signature unless forced.
    if !payload.force && !payload.no_rom_zip {
        if let Some(existing) = state.worker.jobs.find_reusable(&signature).await? {
            let artifact = existing.artifact_path.clone().unwrap_or_default();
            if !artifact.is_empty() && Path::new(&artifact).exists() {
                // The uploaded archive is never consulted on this path.
                if let Some(archive) = extra_mods_archive_path.as_deref() {
                    let _ = tokio::fs::remove_file(archive).await;
                }
                let now = chrono::Utc::now();
                job.status = JobStatus::Reused;
                job.return_code = Some(0);
                job.artifact_path = Some(artifact);
                job.reused_from_job_id = Some(existing.id);
                job.started_at = Some(now);
                job.finished_at = Some(now);
                state.worker.jobs.insert(&job).await?;
                return Ok(Json(job));
            }
        }
    }

    job.extra_mods_archive_path = extra_mods_archive_path;
    state.worker.jobs.insert(&job).await?;

    let item = state
        .worker
        .queue
        .enqueue(QUEUE_BUILDS, functions::BUILD, json!({"job_id": job.id}))
        .await
        .map_err(HttpError::from)?;
    state.worker.jobs.set_queue_job_id(&job.id, &item.queue_job_id).await?;
    job.queue_job_id = Some(item.queue_job_id);
    Ok(Json(job))
}

#[derive(Deserialize)]
pub struct ListQuery {
    limit: Option<u32>,
}

/// `GET /jobs?limit=N`: recent jobs, newest first, cap 200.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<JobRecord>>, HttpError> {
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.worker.jobs.list_recent(limit).await?))
}

/// `GET /jobs/{id}`.
pub async fn get(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<JobRecord>, HttpError> {
    let job = state
        .worker
        .jobs
        .get(&job_id)
        .await?
        .ok_or_else(|| HttpError::not_found("Job not found"))?;
    Ok(Json(job))
}

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub signal_type: Option<StopSignal>,
}

/// `POST /jobs/{id}/stop`: queued jobs are canceled in place; running jobs
/// get a stop task on the controls queue (the worker shares the child's pid
/// namespace, this process may not).
pub async fn stop(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
    payload: Option<Json<StopRequest>>,
) -> Result<Json<JobRecord>, HttpError> {
    let job = state
        .worker
        .jobs
        .get(&job_id)
        .await?
        .ok_or_else(|| HttpError::not_found("Job not found"))?;

    if job.status.is_terminal() {
        return Ok(Json(job));
    }

    let signal = payload
        .and_then(|Json(body)| body.signal_type)
        .unwrap_or_default();

    if job.status == JobStatus::Queued {
        if let Some(queue_job_id) = job.queue_job_id.as_deref() {
            state
                .worker
                .queue
                .remove_by_queue_job_id(QUEUE_BUILDS, queue_job_id)
                .await;
        }
        state
            .worker
            .jobs
            .mark_finished(
                &job_id,
                &uwb_core::ports::JobFinish {
                    status: JobStatus::Canceled,
                    return_code: None,
                    error: Some("Build canceled by user (queued job)".to_string()),
                    artifact_path: None,
                },
            )
            .await?;
    } else {
        state
            .worker
            .queue
            .enqueue(
                uwb_broker::QUEUE_CONTROLS,
                functions::STOP_JOB,
                json!({"job_id": job_id, "signal_type": signal.as_str()}),
            )
            .await
            .map_err(HttpError::from)?;
        state
            .worker
            .jobs
            .set_error(
                &job_id,
                &format!("Stop requested by user ({})", signal.as_str().to_uppercase()),
            )
            .await?;
    }

    let job = state
        .worker
        .jobs
        .get(&job_id)
        .await?
        .ok_or_else(|| HttpError::not_found("Job not found"))?;
    Ok(Json(job))
}

async fn stream_zip(path: &Path) -> Result<Response, HttpError> {
    if !path.exists() {
        return Err(HttpError::not_found("Artifact file is missing"));
    }
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| HttpError::Internal(e.to_string()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact.zip".to_string());

    Response::builder()
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{name}\""),
        )
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| HttpError::Internal(e.to_string()))
}

/// `GET /jobs/{id}/artifact`.
pub async fn artifact(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Response, HttpError> {
    let job = state
        .worker
        .jobs
        .get(&job_id)
        .await?
        .ok_or_else(|| HttpError::not_found("Artifact not found"))?;
    let path = job
        .artifact_path
        .ok_or_else(|| HttpError::not_found("Artifact not found"))?;
    stream_zip(Path::new(&path)).await
}

/// `GET /artifacts/latest/{target}`.
pub async fn latest_artifact(
    State(state): State<AppState>,
    UrlPath(target): UrlPath<String>,
) -> Result<Response, HttpError> {
    let root = resolve_root(&state).ok_or_else(|| HttpError::bad_request("Unknown target"))?;
    if !workspace::target_codenames(&root).contains(&target) {
        return Err(HttpError::bad_request("Unknown target"));
    }
    let job = state
        .worker
        .jobs
        .latest_artifact_for_target(&target)
        .await?
        .ok_or_else(|| HttpError::not_found("Latest artifact not found for target"))?;
    let path = job
        .artifact_path
        .ok_or_else(|| HttpError::not_found("Latest artifact not found for target"))?;
    stream_zip(Path::new(&path)).await
}

/// `GET /jobs/{id}/hints`: run the hint probes over the last 512 KiB of the
/// job log. Advisory; an empty list is a normal answer.
pub async fn hints(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let job = state
        .worker
        .jobs
        .get(&job_id)
        .await?
        .ok_or_else(|| HttpError::not_found("Job not found"))?;
    let Some(log_path) = job.log_path else {
        return Ok(Json(json!({"hints": []})));
    };

    let tail = read_log_tail(Path::new(&log_path), HINT_TAIL_BYTES).await;
    let hints = detect_build_hints(&tail);
    Ok(Json(json!({"hints": hints})))
}

async fn read_log_tail(path: &Path, max_bytes: u64) -> String {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return String::new();
    };
    let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
    let start = size.saturating_sub(max_bytes);
    if file.seek(SeekFrom::Start(start)).await.is_err() {
        return String::new();
    }
    let mut buf = Vec::with_capacity((size - start) as usize);
    if file.read_to_end(&mut buf).await.is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_list_rejects_quote_and_newline() {
        let bad = vec!["app/Ok".to_string(), "app/\"Bad\"".to_string()];
        assert!(normalize_path_list(Some(&bad)).is_err());
        let bad = vec!["app/line\nbreak".to_string()];
        assert!(normalize_path_list(Some(&bad)).is_err());
    }

    #[test]
    fn path_list_trims_and_dedupes_preserving_order() {
        let values = vec![
            " app/B ".to_string(),
            "app/A".to_string(),
            "app/B".to_string(),
            String::new(),
        ];
        let out = normalize_path_list(Some(&values)).unwrap();
        assert_eq!(out, vec!["app/B", "app/A"]);
    }

    #[tokio::test]
    async fn log_tail_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.log");
        std::fs::write(&path, "x".repeat(4096) + "needle").unwrap();

        let tail = read_log_tail(&path, 16).await;
        assert_eq!(tail.len(), 16);
        assert!(tail.ends_with("needle"));
        assert!(read_log_tail(&dir.path().join("missing"), 16).await.is_empty());
    }
}
