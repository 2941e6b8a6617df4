//! Health probes, the `/defaults` fan-in, option catalogs and the metrics
//! read-out.

use std::path::{Path, PathBuf};

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};

use uwb_core::workspace;
use uwb_runtime::git;

use crate::error::HttpError;
use crate::state::AppState;

/// Build-tree root for the current request, probed by sentinel paths.
pub fn resolve_root(state: &AppState) -> Option<PathBuf> {
    workspace::resolve_workspace_root(&state.worker.config)
}

/// `GET /healthz`: broker ping only.
pub async fn healthz(State(state): State<AppState>) -> Response {
    if state.worker.bus.ping().await {
        Json(json!({"status": "ok"})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "down", "reason": "broker unavailable"})),
        )
            .into_response()
    }
}

/// `GET /readyz`: broker ping and a store round trip.
pub async fn readyz(State(state): State<AppState>) -> Response {
    let broker_ok = state.worker.bus.ping().await;
    let store_ok = state.worker.jobs.ping().await;
    if broker_ok && store_ok {
        Json(json!({"status": "ready"})).into_response()
    } else {
        let reason = if broker_ok { "store unavailable" } else { "broker unavailable" };
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "down", "reason": reason})),
        )
            .into_response()
    }
}

/// Resolve "latest available firmware version" for a `MODEL/CSC` through the
/// serve-stale cache.
pub async fn latest_firmware_version(state: &AppState, model: &str, csc: &str) -> String {
    if model.is_empty() || csc.is_empty() {
        return String::new();
    }
    let key = format!("{}_{}", model.to_uppercase(), csc.to_uppercase());
    let url = format!(
        "https://fota-cloud-dn.ospserver.net/firmware/{csc}/{model}/version.xml"
    );
    let http = state.http.clone();

    state
        .fw_latest
        .get_or_fetch(&key, async move {
            let body = http.get(&url).send().await.ok()?.text().await.ok()?;
            let latest = regex::Regex::new(r"<latest[^>]*>(.*?)</latest>")
                .ok()?
                .captures(&body)
                .map(|c| c[1].trim().to_string())
                .unwrap_or_default();
            Some(Value::String(latest))
        })
        .await
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Version markers of a cached firmware entry (`.downloaded` / `.extracted`).
fn read_marker(dir: &Path, marker: &str) -> String {
    std::fs::read_to_string(dir.join(marker))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Status block for the source/target firmware cards on the dashboard.
async fn firmware_status(state: &AppState, firmware_value: &str) -> Value {
    let (model, csc) = workspace::parse_model_csc(firmware_value);
    let latest = latest_firmware_version(state, &model, &csc).await;
    let key = if model.is_empty() || csc.is_empty() {
        String::new()
    } else {
        format!("{}_{}", model.to_uppercase(), csc.to_uppercase())
    };

    let out_dir = &state.worker.config.out_dir;
    let downloaded = read_marker(&out_dir.join("odin").join(&key), ".downloaded");
    let extracted = read_marker(&out_dir.join("fw").join(&key), ".extracted");

    json!({
        "source_model": model,
        "source_csc": csc,
        "latest_version": latest,
        "downloaded_version": downloaded,
        "extracted_version": extracted,
        "up_to_date": !latest.is_empty() && (downloaded == latest || extracted == latest),
    })
}

#[derive(Deserialize)]
pub struct DefaultsQuery {
    target: Option<String>,
}

/// `GET /defaults`: the fan-in feeding most of the UI in one request.
pub async fn defaults(
    State(state): State<AppState>,
    Query(query): Query<DefaultsQuery>,
) -> Result<Json<Value>, HttpError> {
    let config = &state.worker.config;
    let root = resolve_root(&state);

    let (targets, target_options) = match &root {
        Some(root) => (
            workspace::target_codenames(root),
            workspace::target_options(root),
        ),
        None => (Vec::new(), Vec::new()),
    };
    let selected = query
        .target
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| {
            if targets.iter().any(|t| t == "b0s") {
                "b0s".to_string()
            } else {
                targets.first().cloned().unwrap_or_default()
            }
        });

    let defaults = match (&root, selected.is_empty()) {
        (Some(root), false) => workspace::defaults_for_target(root, &selected),
        _ => workspace::TargetDefaults::default(),
    };

    // Commit snapshot and sync state are 30 s cached: `git` is a subprocess.
    let commit_details = {
        let root = root.clone();
        let config = config.clone();
        state
            .commit_snapshot
            .get_or_fetch("commit", async move {
                let details = git::resolve_commit_details(root.as_deref(), &config).await;
                serde_json::to_value(details).ok()
            })
            .await
            .unwrap_or_else(|| json!({}))
    };
    let branch = commit_details
        .get("branch")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let repo_sync = {
        let root = root.clone();
        state
            .repo_info
            .get_or_fetch("sync", async move {
                let status = git::repo_sync_status(root.as_deref(), &branch).await;
                serde_json::to_value(status).ok()
            })
            .await
            .unwrap_or_else(|| json!({"state": "unknown"}))
    };

    let latest_artifact_available = if selected.is_empty() {
        false
    } else {
        state
            .worker
            .jobs
            .latest_artifact_for_target(&selected)
            .await?
            .and_then(|job| job.artifact_path)
            .is_some_and(|path| Path::new(&path).exists())
    };

    let source_status = firmware_status(&state, &defaults.source_firmware).await;
    let target_status = firmware_status(&state, &defaults.target_firmware).await;

    Ok(Json(json!({
        "targets": targets,
        "target_options": target_options,
        "target": selected,
        "defaults": defaults,
        "current_commit": commit_details.get("short_hash").and_then(Value::as_str).unwrap_or(&config.source_commit),
        "current_commit_subject": commit_details.get("subject").and_then(Value::as_str).unwrap_or(""),
        "current_commit_details": commit_details,
        "latest_artifact_available": latest_artifact_available,
        "repo_sync": repo_sync,
        "firmware_status": source_status,
        "target_firmware_status": target_status,
        "repo_root": root.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default(),
    })))
}

/// `GET /debloat/options`.
pub async fn debloat_options(State(state): State<AppState>) -> Json<Value> {
    let entries = resolve_root(&state)
        .map(|root| uwb_core::debloat::parse_debloat_entries(&root))
        .unwrap_or_default();
    Json(json!({"entries": entries}))
}

/// `GET /mods/options`.
pub async fn mods_options(State(state): State<AppState>) -> Json<Value> {
    let entries = resolve_root(&state)
        .map(|root| uwb_core::mods::parse_mod_entries(&root))
        .unwrap_or_default();
    Json(json!({"entries": entries}))
}

#[derive(Deserialize)]
pub struct FfQuery {
    target: String,
}

/// `GET /ff/options?target=`: the merged per-target default feature map.
pub async fn ff_options(
    State(state): State<AppState>,
    Query(query): Query<FfQuery>,
) -> Result<Json<Value>, HttpError> {
    let root = resolve_root(&state).ok_or_else(|| HttpError::bad_request("Unknown target"))?;
    if !workspace::target_codenames(&root).contains(&query.target) {
        return Err(HttpError::bad_request("Unknown target"));
    }
    let merged = uwb_core::ff::ff_defaults_for_target(&root, &query.target);
    let entries: Vec<Value> = merged
        .iter()
        .map(|(key, value)| json!({"key": key, "value": value}))
        .collect();
    Ok(Json(json!({"entries": entries})))
}

/// `GET /metrics/http`: per-route latency histograms with CDF quantiles.
pub async fn http_metrics(State(state): State<AppState>) -> Json<Value> {
    let routes = state.metrics.summary().await;
    Json(json!({"routes": routes}))
}
