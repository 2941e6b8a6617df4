//! Progress snapshot payloads and the stream/channel names they travel on.
//!
//! Three streams exist: firmware (keyed by `MODEL_CSC`), build (keyed by job
//! id) and repo (single slot, one repo operation at a time). Snapshots carry
//! full state so subscribers tolerate missed deltas.

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const FIRMWARE_PROGRESS_KEY: &str = "un1ca:firmware_progress";
pub const FIRMWARE_PROGRESS_CHANNEL: &str = "un1ca:firmware_progress_events";
pub const BUILD_PROGRESS_KEY: &str = "un1ca:build_progress";
pub const BUILD_PROGRESS_CHANNEL: &str = "un1ca:build_progress_events";
pub const REPO_PROGRESS_KEY: &str = "un1ca:repo_progress";
pub const REPO_PROGRESS_CHANNEL: &str = "un1ca:repo_progress_events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Running,
    Completed,
    Failed,
}

/// What a firmware tracker is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Download,
    Extract,
}

/// Stage of a repo operation; set by the caller, never parsed from output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoStage {
    Clone,
    Pull,
    Submodules,
    Delete,
}

/// One progress snapshot/delta. The same shape serves all three streams;
/// stream-specific fields stay `None` elsewhere and are skipped on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ProgressStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fw_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<ProgressPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<RepoStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_bps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl ProgressUpdate {
    /// A `progress`-typed update with status and current timestamp.
    pub fn progress(status: ProgressStatus) -> Self {
        Self {
            kind: "progress".to_string(),
            status: Some(status),
            updated_at: Some(Utc::now().to_rfc3339()),
            ..Self::default()
        }
    }

    /// The `removed` tombstone published on explicit deletion.
    pub fn removed() -> Self {
        Self {
            kind: "removed".to_string(),
            updated_at: Some(Utc::now().to_rfc3339()),
            ..Self::default()
        }
    }
}
