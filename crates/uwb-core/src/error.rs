//! Error taxonomy shared across the workbench crates.
//!
//! `CoreError` covers request-level failures raised inline by the HTTP layer;
//! `StoreError` covers persistence failures from the job/settings stores.
//! Job-level failures (non-zero exit, stop timeouts) are not errors at this
//! layer: they are captured into the job row by the worker.

use thiserror::Error;

/// Request-level error raised by validation, lookup and auth paths.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad input; maps to a 400 response, no job is created.
    #[error("{0}")]
    Validation(String),

    /// Unknown job/target/artifact; maps to 404.
    #[error("{0}")]
    NotFound(String),

    /// Missing or invalid token; 401 on HTTP, close code 4401 on WebSocket.
    #[error("{0}")]
    Auth(String),

    /// Non-fast-forward pull and similar; maps to 409.
    #[error("{0}")]
    Conflict(String),

    /// Broker or store unavailable; 503 for health checks, best-effort
    /// degradation elsewhere.
    #[error("{0}")]
    Infra(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

/// Persistence failure from a job or settings store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}
