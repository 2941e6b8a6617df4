//! Server-sent-events log streaming: from offset 0, poll the log file every
//! second, one `data:` event per line, `event: done` on terminal status.

use std::convert::Infallible;
use std::path::PathBuf;

use axum::extract::{Path as UrlPath, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;

use crate::error::HttpError;
use crate::state::AppState;
use crate::ws::read_chunk;

/// `GET /jobs/{id}/logs`.
pub async fn job_logs(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>, HttpError> {
    let job = state
        .worker
        .jobs
        .get(&job_id)
        .await?
        .ok_or_else(|| HttpError::not_found("Job not found"))?;
    let log_path = job
        .log_path
        .map(PathBuf::from)
        .ok_or_else(|| HttpError::not_found("Log file not available yet"))?;

    let stream = async_stream::stream! {
        let mut pos = 0u64;
        let mut carry = String::new();
        loop {
            let status = match state.worker.jobs.get(&job_id).await {
                Ok(Some(job)) => Some(job.status),
                _ => None,
            };

            let (chunk, next) = read_chunk(&log_path, pos).await;
            pos = next;
            if !chunk.is_empty() {
                carry.push_str(&chunk);
                // Emit whole lines; keep a trailing partial line for the
                // next poll.
                while let Some(newline) = carry.find('\n') {
                    let line: String = carry.drain(..=newline).collect();
                    yield Ok(Event::default().data(line.trim_end_matches(['\r', '\n'])));
                }
            }

            if let Some(status) = status {
                if status.is_terminal() {
                    if !carry.is_empty() {
                        yield Ok(Event::default().data(carry.clone()));
                    }
                    yield Ok(Event::default().event("done").data("build_finished"));
                    break;
                }
            }

            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
