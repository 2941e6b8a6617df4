//! Axum adapter: request validation, auth, metrics middleware, job and
//! firmware endpoints, log tailing over SSE/WebSocket and progress fan-out
//! over WebSocket.

mod auth;
mod error;
mod handlers;
mod metrics_mw;
mod routes;
mod sse;
mod state;
mod uploads;
mod ws;

pub use routes::create_router;
pub use state::{AppContext, AppState};

/// Serve the API on the configured bind address until the task is aborted.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = state.worker.config.bind_addr.clone();
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "http server listening");
    axum::serve(listener, router).await?;
    Ok(())
}
