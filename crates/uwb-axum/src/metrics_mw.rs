//! Latency-histogram middleware: records `(method, route_template)` timings
//! into the shared store after every response.

use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::state::AppState;

pub async fn record_latency(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().as_str().to_string();
    // The route template ("/jobs/{id}"), not the concrete path: keeps the
    // key space bounded.
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let started = Instant::now();
    let response = next.run(request).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    state
        .metrics
        .record(&method, &route, response.status().as_u16(), elapsed_ms)
        .await;
    response
}
