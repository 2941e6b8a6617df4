//! Samsung firmware cache endpoints: the card listing with latest-version
//! resolution, and the enqueue-backed delete and extract operations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use axum::Json;
use axum::extract::{Path as UrlPath, Query, State};
use futures_util::future::join_all;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Semaphore;

use uwb_broker::{QUEUE_BUILDS, dir_size_cache_key};
use uwb_core::job::JobRecord;
use uwb_core::workspace;
use uwb_runtime::jobs::functions;

use crate::error::HttpError;
use crate::handlers::meta::{latest_firmware_version, resolve_root};
use crate::state::AppState;

/// Bounded parallelism for latest-version lookups.
const LATEST_POOL: usize = 8;

static FW_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("static regex"));

/// Recursive directory size, resolved through the 20-minute cache with the
/// walk itself on a blocking thread.
async fn dir_size_bytes(state: &AppState, path: &Path) -> u64 {
    let key = dir_size_cache_key(path);
    let path = path.to_path_buf();
    state
        .dir_size
        .get_or_fetch(&key, async move {
            let size = tokio::task::spawn_blocking(move || walk_size(&path)).await.ok()?;
            Some(Value::from(size))
        })
        .await
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
}

fn walk_size(path: &Path) -> u64 {
    let mut total = 0;
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    for entry in entries.filter_map(Result::ok) {
        let entry_path = entry.path();
        if entry_path.is_dir() {
            total += walk_size(&entry_path);
        } else if let Ok(metadata) = entry.metadata() {
            total += metadata.len();
        }
    }
    total
}

fn split_key(name: &str) -> (String, String) {
    match name.split_once('_') {
        Some((model, csc)) => (model.to_string(), csc.to_string()),
        None => (name.to_string(), String::new()),
    }
}

fn read_marker(dir: &Path, marker: &str) -> String {
    std::fs::read_to_string(dir.join(marker))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn subdirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// `GET /firmware/samsung`: one card per `MODEL_CSC` across the Odin and
/// extracted caches, with sizes, versions and live progress attached.
pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let out_dir = state.worker.config.out_dir.clone();
    let mut cards: BTreeMap<String, Value> = BTreeMap::new();

    for (tree, kind) in [("odin", "odin"), ("fw", "fw")] {
        for dir in subdirs(&out_dir.join(tree)) {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (model, csc) = split_key(&name);
            let card = cards.entry(name.clone()).or_insert_with(|| {
                json!({
                    "key": name,
                    "model": model,
                    "csc": csc,
                    "odin_version": "",
                    "fw_version": "",
                    "latest_version": "",
                    "odin_size_bytes": 0,
                    "fw_size_bytes": 0,
                    "has_odin": false,
                    "has_fw": false,
                })
            });
            let size = dir_size_bytes(&state, &dir).await;
            if kind == "odin" {
                card["has_odin"] = json!(true);
                card["odin_size_bytes"] = json!(size);
                card["odin_version"] = json!(read_marker(&dir, ".downloaded"));
            } else {
                card["has_fw"] = json!(true);
                card["fw_size_bytes"] = json!(size);
                card["fw_version"] = json!(read_marker(&dir, ".extracted"));
            }
        }
    }

    // Latest-version resolution fans out over the network; cap it at 8.
    let semaphore = Arc::new(Semaphore::new(LATEST_POOL));
    let lookups = cards.values().map(|card| {
        let state = state.clone();
        let semaphore = semaphore.clone();
        let model = card["model"].as_str().unwrap_or("").to_string();
        let csc = card["csc"].as_str().unwrap_or("").to_string();
        async move {
            let _permit = semaphore.acquire().await;
            latest_firmware_version(&state, &model, &csc).await
        }
    });
    let latest_versions: Vec<String> = join_all(lookups).await;

    let progress = state.worker.firmware_progress.list().await;
    let items: Vec<Value> = cards
        .into_values()
        .zip(latest_versions)
        .map(|(mut card, latest)| {
            let downloaded = card["odin_version"].as_str().unwrap_or("").to_string();
            let extracted = card["fw_version"].as_str().unwrap_or("").to_string();
            card["update_available"] = json!(
                !latest.is_empty()
                    && !downloaded.is_empty()
                    && downloaded != latest
                    && extracted != latest
            );
            card["latest_version"] = json!(latest);
            let key = card["key"].as_str().unwrap_or("").to_string();
            card["progress"] = progress.get(&key).cloned().unwrap_or(Value::Null);
            card
        })
        .collect();

    Json(json!({"items": items}))
}

#[derive(Deserialize)]
pub struct TargetQuery {
    target: Option<String>,
}

fn select_target(targets: &[String], requested: Option<String>) -> Result<String, HttpError> {
    let selected = requested.filter(|t| !t.is_empty()).unwrap_or_else(|| {
        if targets.iter().any(|t| t == "b0s") {
            "b0s".to_string()
        } else {
            targets.first().cloned().unwrap_or_default()
        }
    });
    if selected.is_empty() {
        return Err(HttpError::bad_request("No targets available"));
    }
    if !targets.contains(&selected) {
        return Err(HttpError::bad_request("Unknown target"));
    }
    Ok(selected)
}

/// `DELETE /firmware/samsung/{fw_type}/{fw_key}`: enqueue a delete operation
/// job so the action is logged and cancelable.
pub async fn delete(
    State(state): State<AppState>,
    UrlPath((fw_type, fw_key)): UrlPath<(String, String)>,
    Query(query): Query<TargetQuery>,
) -> Result<Json<JobRecord>, HttpError> {
    if fw_type != "odin" && fw_type != "fw" {
        return Err(HttpError::bad_request("fw_type must be 'odin' or 'fw'"));
    }
    if !FW_KEY_RE.is_match(&fw_key) {
        return Err(HttpError::bad_request("Invalid fw key"));
    }

    let root = resolve_root(&state).ok_or_else(|| HttpError::bad_request("No targets available"))?;
    let target = select_target(&workspace::target_codenames(&root), query.target)?;

    let fw_path = state.worker.config.out_dir.join(&fw_type).join(&fw_key);
    if !fw_path.exists() {
        return Err(HttpError::not_found("FW entry not found"));
    }
    if !fw_path.is_dir() {
        return Err(HttpError::bad_request("FW entry is not a directory"));
    }

    let source_commit =
        uwb_runtime::git::resolve_source_commit(Some(&root), &state.worker.config).await;
    let mut job = JobRecord::new_operation(
        &target,
        &source_commit,
        format!("Delete {} FW entry: {}", fw_type.to_uppercase(), fw_key),
    );

    state.worker.jobs.insert(&job).await?;
    let item = state
        .worker
        .queue
        .enqueue(
            QUEUE_BUILDS,
            functions::DELETE_FW,
            json!({"job_id": job.id, "fw_type": fw_type, "fw_key": fw_key}),
        )
        .await
        .map_err(HttpError::from)?;
    state.worker.jobs.set_queue_job_id(&job.id, &item.queue_job_id).await?;
    job.queue_job_id = Some(item.queue_job_id);

    // The size card for this entry is about to change.
    state.dir_size.invalidate(&dir_size_cache_key(&fw_path)).await;
    Ok(Json(job))
}

/// `POST /firmware/samsung/{fw_key}/extract`: heavy I/O, long runtime — goes
/// through the builds queue for logs and status.
pub async fn extract(
    State(state): State<AppState>,
    UrlPath(fw_key): UrlPath<String>,
    Query(query): Query<TargetQuery>,
) -> Result<Json<JobRecord>, HttpError> {
    if !FW_KEY_RE.is_match(&fw_key) {
        return Err(HttpError::bad_request("Invalid fw key"));
    }

    let root = resolve_root(&state).ok_or_else(|| HttpError::bad_request("No targets available"))?;
    let target = select_target(&workspace::target_codenames(&root), query.target)?;

    let odin_dir = state.worker.config.out_dir.join("odin").join(&fw_key);
    if !odin_dir.is_dir() {
        return Err(HttpError::not_found("ODIN FW entry not found"));
    }

    let source_commit =
        uwb_runtime::git::resolve_source_commit(Some(&root), &state.worker.config).await;
    let mut job = JobRecord::new_operation(
        &target,
        &source_commit,
        format!("Extract FW (-f): {fw_key}"),
    );

    state.worker.jobs.insert(&job).await?;
    let item = state
        .worker
        .queue
        .enqueue(
            QUEUE_BUILDS,
            functions::EXTRACT_FW,
            json!({"job_id": job.id, "fw_key": fw_key, "target": target}),
        )
        .await
        .map_err(HttpError::from)?;
    state.worker.jobs.set_queue_job_id(&job.id, &item.queue_job_id).await?;
    job.queue_job_id = Some(item.queue_job_id);
    Ok(Json(job))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fw_key_pattern() {
        assert!(FW_KEY_RE.is_match("SM-S901B_EUX"));
        assert!(FW_KEY_RE.is_match("SM-S901B_EUX.old-1"));
        assert!(!FW_KEY_RE.is_match("SM-S901B/EUX"));
        assert!(!FW_KEY_RE.is_match("../escape"));
        assert!(!FW_KEY_RE.is_match(""));
    }

    #[test]
    fn target_selection_prefers_b0s() {
        let targets = vec!["a51".to_string(), "b0s".to_string()];
        assert_eq!(select_target(&targets, None).unwrap(), "b0s");
        assert_eq!(select_target(&targets, Some("a51".into())).unwrap(), "a51");
        assert!(select_target(&targets, Some("nope".into())).is_err());
        assert!(select_target(&[], None).is_err());
    }

    #[test]
    fn walk_size_sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/x.bin"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("a/b/y.bin"), vec![0u8; 28]).unwrap();
        assert_eq!(walk_size(dir.path()), 128);
        assert_eq!(walk_size(&dir.path().join("missing")), 0);
    }
}
