//! WebSocket endpoints: job log tailing and the three progress streams.
//!
//! Streams authenticate with the bearer token from the `Authorization`
//! header or a `?token=` query parameter and reject with close code 4401.
//! Handlers stop polling and drop their subscription as soon as the client
//! goes away.

use std::io::SeekFrom;
use std::path::Path;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::auth::ws_authorized;
use crate::state::AppState;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const YIELD_INTERVAL: Duration = Duration::from_millis(100);
const UNAUTHORIZED_CLOSE: u16 = 4401;
const POLICY_CLOSE: u16 = 1008;

#[derive(Deserialize)]
pub struct WsQuery {
    pub tail_kb: Option<u64>,
    pub token: Option<String>,
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn send_json(socket: &mut WebSocket, value: &Value) -> bool {
    socket.send(Message::Text(value.to_string().into())).await.is_ok()
}

fn is_disconnect(message: Option<Result<Message, axum::Error>>) -> bool {
    matches!(message, None | Some(Err(_)) | Some(Ok(Message::Close(_))))
}

/// Read everything new after `pos`; returns the chunk and the new offset.
pub(crate) async fn read_chunk(path: &Path, pos: u64) -> (String, u64) {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return (String::new(), pos);
    };
    if file.seek(SeekFrom::Start(pos)).await.is_err() {
        return (String::new(), pos);
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).await.is_err() {
        return (String::new(), pos);
    }
    let next = pos + buf.len() as u64;
    (String::from_utf8_lossy(&buf).into_owned(), next)
}

/// Initial offset for a tail request: seek back `tail_kb`, then advance to
/// the next line boundary so the first chunk starts on a whole line.
async fn tail_start(path: &Path, tail_kb: u64) -> u64 {
    if tail_kb == 0 {
        let Ok(metadata) = tokio::fs::metadata(path).await else {
            return 0;
        };
        return metadata.len();
    }
    let Ok(file) = tokio::fs::File::open(path).await else {
        return 0;
    };
    let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
    let mut pos = size.saturating_sub(tail_kb * 1024);
    if pos > 0 {
        let mut reader = BufReader::new(file);
        if reader.seek(SeekFrom::Start(pos)).await.is_ok() {
            let mut skipped = Vec::new();
            if let Ok(n) = reader.read_until(b'\n', &mut skipped).await {
                pos += n as u64;
            }
        }
    }
    pos
}

/// `WS /jobs/{id}/ws?tail_kb=N`: historical tail, then 1 s polling of the
/// log file with `{type:"chunk"}` frames and a final `{type:"done"}`.
pub async fn job_logs(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        if !ws_authorized(&state, &headers, query.token.as_deref()).await {
            close_with(socket, UNAUTHORIZED_CLOSE, "unauthorized").await;
            return;
        }
        run_job_logs(state, socket, job_id, query.tail_kb.unwrap_or(256)).await;
    })
}

async fn run_job_logs(state: AppState, mut socket: WebSocket, job_id: String, tail_kb: u64) {
    let job = match state.worker.jobs.get(&job_id).await {
        Ok(Some(job)) => job,
        _ => {
            let _ = send_json(&mut socket, &json!({"type": "error", "message": "Job not found"}))
                .await;
            close_with(socket, POLICY_CLOSE, "job not found").await;
            return;
        }
    };
    let Some(log_path) = job.log_path else {
        let _ = send_json(
            &mut socket,
            &json!({"type": "error", "message": "Log file not available yet"}),
        )
        .await;
        close_with(socket, POLICY_CLOSE, "no log").await;
        return;
    };
    let log_path = std::path::PathBuf::from(log_path);

    let tail_kb = tail_kb.min(4096);
    let mut pos = tail_start(&log_path, tail_kb).await;

    loop {
        let status = match state.worker.jobs.get(&job_id).await {
            Ok(Some(job)) => Some(job.status),
            _ => None,
        };

        let (chunk, next) = read_chunk(&log_path, pos).await;
        pos = next;
        if !chunk.is_empty()
            && !send_json(&mut socket, &json!({"type": "chunk", "chunk": chunk})).await
        {
            return;
        }

        if let Some(status) = status {
            if status.is_terminal() {
                let _ = send_json(
                    &mut socket,
                    &json!({"type": "done", "status": status.as_str()}),
                )
                .await;
                return;
            }
        }

        tokio::select! {
            incoming = socket.recv() => {
                if is_disconnect(incoming) {
                    return;
                }
            }
            () = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

/// Which progress stream a socket subscribes to.
enum ProgressKind {
    Firmware,
    Build,
    Repo,
}

async fn snapshot(state: &AppState, kind: &ProgressKind) -> Value {
    match kind {
        ProgressKind::Firmware => {
            let items: Vec<Value> =
                state.worker.firmware_progress.list().await.into_values().collect();
            json!({"type": "snapshot", "items": items})
        }
        ProgressKind::Build => {
            let items: Vec<Value> =
                state.worker.build_progress.list().await.into_values().collect();
            json!({"type": "snapshot", "items": items})
        }
        ProgressKind::Repo => {
            json!({"type": "snapshot", "item": state.worker.repo_progress.get().await})
        }
    }
}

async fn subscribe(state: &AppState, kind: &ProgressKind) -> mpsc::Receiver<Value> {
    match kind {
        ProgressKind::Firmware => state.worker.firmware_progress.subscribe().await,
        ProgressKind::Build => state.worker.build_progress.subscribe().await,
        ProgressKind::Repo => state.worker.repo_progress.subscribe().await,
    }
}

async fn run_progress(state: AppState, mut socket: WebSocket, kind: ProgressKind) {
    if !send_json(&mut socket, &snapshot(&state, &kind).await).await {
        return;
    }
    // Dropping the receiver on return releases the subscription within one
    // poll cycle.
    let mut rx = subscribe(&state, &kind).await;

    loop {
        tokio::select! {
            delta = rx.recv() => {
                match delta {
                    Some(payload) => {
                        if !send_json(&mut socket, &payload).await {
                            return;
                        }
                    }
                    None => return,
                }
            }
            incoming = socket.recv() => {
                if is_disconnect(incoming) {
                    return;
                }
            }
        }
        tokio::time::sleep(YIELD_INTERVAL).await;
    }
}

macro_rules! progress_ws {
    ($name:ident, $kind:expr) => {
        pub async fn $name(
            State(state): State<AppState>,
            Query(query): Query<WsQuery>,
            headers: HeaderMap,
            ws: WebSocketUpgrade,
        ) -> Response {
            ws.on_upgrade(move |socket| async move {
                if !ws_authorized(&state, &headers, query.token.as_deref()).await {
                    close_with(socket, UNAUTHORIZED_CLOSE, "unauthorized").await;
                    return;
                }
                run_progress(state, socket, $kind).await;
            })
        }
    };
}

progress_ws!(firmware_progress, ProgressKind::Firmware);
progress_ws!(build_progress, ProgressKind::Build);
progress_ws!(repo_progress, ProgressKind::Repo);

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tail_start_aligns_to_line_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        tokio::fs::write(&path, "first line\nsecond line\nthird line\n")
            .await
            .unwrap();

        // Small tail that lands mid-line: the partial line is discarded.
        let size = tokio::fs::metadata(&path).await.unwrap().len();
        let pos = tail_start(&path, 0).await;
        assert_eq!(pos, size);

        // One KiB covers the whole file: start from 0, no alignment needed.
        let pos = tail_start(&path, 1).await;
        assert_eq!(pos, 0);
    }

    #[tokio::test]
    async fn tail_zero_emits_only_new_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        tokio::fs::write(&path, "history\n").await.unwrap();

        let pos = tail_start(&path, 0).await;
        let (chunk, pos) = read_chunk(&path, pos).await;
        assert!(chunk.is_empty());

        tokio::fs::write(&path, "history\nnew stuff\n").await.unwrap();
        let (chunk, _) = read_chunk(&path, pos).await;
        assert_eq!(chunk, "new stuff\n");
    }

    #[tokio::test]
    async fn read_chunk_tracks_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        tokio::fs::write(&path, "abc").await.unwrap();

        let (chunk, pos) = read_chunk(&path, 0).await;
        assert_eq!(chunk, "abc");
        assert_eq!(pos, 3);

        let (chunk, pos) = read_chunk(&path, pos).await;
        assert!(chunk.is_empty());
        assert_eq!(pos, 3);
    }
}
