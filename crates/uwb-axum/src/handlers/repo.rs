//! Repo endpoints: clone/pull/submodules/delete operation jobs and the git
//! remote configuration settings.

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use uwb_broker::QUEUE_BUILDS;
use uwb_core::job::JobRecord;
use uwb_core::ports::settings_keys;
use uwb_runtime::git;
use uwb_runtime::jobs::functions;

use crate::error::HttpError;
use crate::handlers::meta::resolve_root;
use crate::state::AppState;

async fn setting(state: &AppState, key: &str) -> Option<String> {
    state.worker.settings.get(key).await.ok().flatten().filter(|v| !v.is_empty())
}

async fn enqueue_repo_job(
    state: &AppState,
    operation_name: String,
    function: &str,
    mut args: Value,
) -> Result<Json<JobRecord>, HttpError> {
    let config = &state.worker.config;
    let root = resolve_root(state);
    let source_commit = git::resolve_source_commit(root.as_deref(), config).await;
    // Repo jobs are not tied to a device; record the repo itself as target.
    let mut job = JobRecord::new_operation("repo", &source_commit, operation_name);

    state.worker.jobs.insert(&job).await?;
    args["job_id"] = json!(job.id);
    let item = state
        .worker
        .queue
        .enqueue(QUEUE_BUILDS, function, args)
        .await
        .map_err(HttpError::from)?;
    state.worker.jobs.set_queue_job_id(&job.id, &item.queue_job_id).await?;
    job.queue_job_id = Some(item.queue_job_id);

    // Commit/sync caches describe a tree that is about to change.
    state.commit_snapshot.invalidate("commit").await;
    state.repo_info.invalidate("sync").await;
    Ok(Json(job))
}

/// `POST /repo/clone`: wipe and clone using the configured remote, splicing
/// stored credentials into the URL (never logged).
pub async fn clone(State(state): State<AppState>) -> Result<Json<JobRecord>, HttpError> {
    let config = &state.worker.config;
    let url = setting(&state, settings_keys::GIT_URL)
        .await
        .unwrap_or_else(|| config.repo_url_default.clone());
    let reference = setting(&state, settings_keys::GIT_REF)
        .await
        .unwrap_or_else(|| config.repo_ref_default.clone());
    let username = setting(&state, settings_keys::GIT_USERNAME).await;
    let token = setting(&state, settings_keys::GIT_TOKEN).await;
    let clone_url =
        git::clone_url_with_credentials(&url, username.as_deref(), token.as_deref());

    enqueue_repo_job(
        &state,
        format!("Clone repository ({reference})"),
        functions::REPO_CLONE,
        json!({"git_url": clone_url, "git_ref": reference}),
    )
    .await
}

/// `POST /repo/pull`: update the checkout to the configured ref.
pub async fn pull(State(state): State<AppState>) -> Result<Json<JobRecord>, HttpError> {
    let root = resolve_root(&state)
        .ok_or_else(|| HttpError::Conflict("Repository is not cloned yet".to_string()))?;
    if !root.join(".git").is_dir() {
        return Err(HttpError::Conflict("Repository is not cloned yet".to_string()));
    }
    let reference = setting(&state, settings_keys::GIT_REF)
        .await
        .unwrap_or_else(|| state.worker.config.repo_ref_default.clone());

    enqueue_repo_job(
        &state,
        format!("Update repository ({reference})"),
        functions::REPO_PULL,
        json!({"git_ref": reference}),
    )
    .await
}

/// `POST /repo/submodules`.
pub async fn submodules(State(state): State<AppState>) -> Result<Json<JobRecord>, HttpError> {
    let root = resolve_root(&state)
        .ok_or_else(|| HttpError::Conflict("Repository is not cloned yet".to_string()))?;
    if !root.join(".git").is_dir() {
        return Err(HttpError::Conflict("Repository is not cloned yet".to_string()));
    }

    enqueue_repo_job(
        &state,
        "Update submodules".to_string(),
        functions::REPO_SUBMODULES,
        json!({}),
    )
    .await
}

#[derive(Deserialize)]
pub struct DeleteQuery {
    mode: Option<String>,
}

/// `DELETE /repo?mode=repo_only|repo_with_out`.
pub async fn delete(
    State(state): State<AppState>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<JobRecord>, HttpError> {
    let mode = query.mode.unwrap_or_else(|| "repo_only".to_string());
    if mode != "repo_only" && mode != "repo_with_out" {
        return Err(HttpError::bad_request(
            "mode must be 'repo_only' or 'repo_with_out'",
        ));
    }

    let title = if mode == "repo_with_out" {
        "Delete repository (with out)"
    } else {
        "Delete repository (keep out)"
    };
    enqueue_repo_job(
        &state,
        title.to_string(),
        functions::REPO_DELETE,
        json!({"mode": mode}),
    )
    .await
}

#[derive(Deserialize)]
pub struct RepoConfigUpdate {
    pub git_url: String,
    pub git_ref: Option<String>,
    pub git_username: Option<String>,
    pub git_token: Option<String>,
}

/// `GET /repo/config`: the stored remote settings; the token is reported
/// only as a presence flag.
pub async fn get_config(State(state): State<AppState>) -> Result<Json<Value>, HttpError> {
    let config = &state.worker.config;
    let url = setting(&state, settings_keys::GIT_URL)
        .await
        .unwrap_or_else(|| config.repo_url_default.clone());
    let reference = setting(&state, settings_keys::GIT_REF)
        .await
        .unwrap_or_else(|| config.repo_ref_default.clone());
    let username = setting(&state, settings_keys::GIT_USERNAME).await.unwrap_or_default();
    let has_token = setting(&state, settings_keys::GIT_TOKEN).await.is_some();

    Ok(Json(json!({
        "git_url": url,
        "git_ref": reference,
        "git_username": username,
        "has_token": has_token,
    })))
}

/// `PUT /repo/config`: store the remote settings. An empty token clears the
/// stored one.
pub async fn put_config(
    State(state): State<AppState>,
    Json(payload): Json<RepoConfigUpdate>,
) -> Result<Json<Value>, HttpError> {
    let url = payload.git_url.trim();
    if url.len() < 8 {
        return Err(HttpError::bad_request("git_url is too short"));
    }
    let settings = &state.worker.settings;
    settings.set(settings_keys::GIT_URL, url).await?;

    if let Some(reference) = payload.git_ref.as_deref().map(str::trim) {
        if reference.is_empty() {
            settings.delete(settings_keys::GIT_REF).await?;
        } else {
            settings.set(settings_keys::GIT_REF, reference).await?;
        }
    }
    if let Some(username) = payload.git_username.as_deref().map(str::trim) {
        if username.is_empty() {
            settings.delete(settings_keys::GIT_USERNAME).await?;
        } else {
            settings.set(settings_keys::GIT_USERNAME, username).await?;
        }
    }
    if let Some(token) = payload.git_token.as_deref().map(str::trim) {
        if token.is_empty() {
            settings.delete(settings_keys::GIT_TOKEN).await?;
        } else {
            settings.set(settings_keys::GIT_TOKEN, token).await?;
        }
    }

    get_config(State(state)).await
}
