//! Route definitions and router construction.
//!
//! Middleware order (outermost first): CORS, latency recording, then
//! bearer-token auth on the protected tree. Health probes and login stay
//! open; WebSocket routes authenticate themselves so browsers can pass the
//! token as a query parameter.

use axum::Router;
use axum::http::HeaderValue;
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use tower_http::cors::{Any, CorsLayer};

use crate::auth::require_auth;
use crate::handlers;
use crate::metrics_mw::record_latency;
use crate::state::AppState;
use crate::{sse, ws};

fn build_cors_layer(origins: &str) -> CorsLayer {
    let trimmed: Vec<&str> = origins
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .collect();
    if trimmed.is_empty() || trimmed.contains(&"*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let allowed: Vec<HeaderValue> =
            trimmed.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(allowed)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Routes that skip bearer auth: liveness/readiness and login.
fn open_routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(handlers::meta::healthz))
        .route("/readyz", get(handlers::meta::readyz))
        .route("/auth/login", post(handlers::auth::login))
}

/// WebSocket routes; each handler checks the token itself (header or
/// `?token=`) and closes with 4401.
fn ws_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs/{id}/ws", get(ws::job_logs))
        .route("/firmware/progress/ws", get(ws::firmware_progress))
        .route("/build/progress/ws", get(ws::build_progress))
        .route("/repo/progress/ws", get(ws::repo_progress))
}

fn protected_routes(state: AppState) -> Router<AppState> {
    Router::new()
        // Jobs API
        .route("/jobs", post(handlers::jobs::create).get(handlers::jobs::list))
        .route("/jobs/{id}", get(handlers::jobs::get))
        .route("/jobs/{id}/stop", post(handlers::jobs::stop))
        .route("/jobs/{id}/artifact", get(handlers::jobs::artifact))
        .route("/jobs/{id}/hints", get(handlers::jobs::hints))
        .route("/jobs/{id}/logs", get(sse::job_logs))
        .route("/artifacts/latest/{target}", get(handlers::jobs::latest_artifact))
        // Dashboard fan-in and option catalogs
        .route("/defaults", get(handlers::meta::defaults))
        .route("/debloat/options", get(handlers::meta::debloat_options))
        .route("/mods/options", get(handlers::meta::mods_options))
        .route("/ff/options", get(handlers::meta::ff_options))
        .route("/metrics/http", get(handlers::meta::http_metrics))
        // Samsung firmware cache
        .route("/firmware/samsung", get(handlers::firmware::list))
        .route(
            "/firmware/samsung/{fw_type}/{fw_key}",
            delete(handlers::firmware::delete),
        )
        // Same tree as the delete route, so the segment shares its name;
        // here it carries the firmware key.
        .route(
            "/firmware/samsung/{fw_type}/extract",
            post(handlers::firmware::extract),
        )
        // Mod uploads
        .route("/mods/upload", post(handlers::mods::upload))
        // Repo operations and configuration
        .route("/repo/clone", post(handlers::repo::clone))
        .route("/repo/pull", post(handlers::repo::pull))
        .route("/repo/submodules", post(handlers::repo::submodules))
        .route("/repo", delete(handlers::repo::delete))
        .route(
            "/repo/config",
            get(handlers::repo::get_config).put(handlers::repo::put_config),
        )
        // Password management stays behind auth once enabled
        .route("/auth/password", post(handlers::auth::set_password))
        .layer(from_fn_with_state(state, require_auth))
}

/// Create the main router with all routes, middleware and state applied.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.worker.config.cors_origins);

    Router::new()
        .merge(open_routes())
        .merge(ws_routes())
        .merge(protected_routes(state.clone()))
        .layer(from_fn_with_state(state.clone(), record_latency))
        .layer(cors)
        .with_state(state)
}
