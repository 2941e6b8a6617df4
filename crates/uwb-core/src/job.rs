//! Job records and request payloads.
//!
//! A single `build_jobs` table holds both ROM builds and operation jobs
//! (firmware extract/delete, repo clone/pull/submodules/delete, stop), so the
//! UI renders one uniform list. Status transitions are linearized through the
//! persistent store; exactly one terminal status is ever entered and never
//! left.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal statuses; once entered a job never leaves them.
pub const TERMINAL_STATUSES: [JobStatus; 4] = [
    JobStatus::Succeeded,
    JobStatus::Failed,
    JobStatus::Canceled,
    JobStatus::Reused,
];

/// Lifecycle status of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Reused,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Reused => "reused",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            "reused" => Self::Reused,
            _ => Self::Queued,
        }
    }

    pub fn is_terminal(self) -> bool {
        TERMINAL_STATUSES.contains(&self)
    }
}

/// Build vs. operation (extract, delete, repo ops, stop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Build,
    Operation,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Operation => "operation",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value == "operation" {
            Self::Operation
        } else {
            Self::Build
        }
    }
}

/// Signal selection for a stop request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopSignal {
    #[default]
    Sigterm,
    Sigkill,
}

impl StopSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sigterm => "sigterm",
            Self::Sigkill => "sigkill",
        }
    }

    /// Confirmation window before the job is left `running` with a retry hint.
    pub fn confirm_timeout_secs(self) -> u64 {
        match self {
            Self::Sigterm => 25,
            Self::Sigkill => 5,
        }
    }
}

/// Generate a fresh 128-bit job identifier in string form.
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One row of the `build_jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    /// Serialized as `job_kind`, the field name the UI contract uses.
    #[serde(rename = "job_kind")]
    pub kind: JobKind,
    pub operation_name: Option<String>,
    pub target: String,
    pub source_commit: String,
    pub source_firmware: Option<String>,
    pub target_firmware: Option<String>,
    pub version_major: Option<i64>,
    pub version_minor: Option<i64>,
    pub version_patch: Option<i64>,
    pub version_suffix: Option<String>,
    pub build_signature: Option<String>,
    pub force: bool,
    pub no_rom_zip: bool,
    pub status: JobStatus,
    pub queue_job_id: Option<String>,
    pub process_pid: Option<i64>,
    pub return_code: Option<i64>,
    pub error: Option<String>,
    pub log_path: Option<String>,
    pub artifact_path: Option<String>,
    pub reused_from_job_id: Option<String>,
    pub extra_mods_archive_path: Option<String>,
    pub extra_mods_modules_json: Option<String>,
    pub mods_disabled_json: Option<String>,
    pub debloat_disabled_json: Option<String>,
    pub debloat_add_system_json: Option<String>,
    pub debloat_add_product_json: Option<String>,
    pub ff_overrides_json: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// A fresh `queued` build job with empty payloads.
    pub fn new_build(target: impl Into<String>, source_commit: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_job_id(),
            kind: JobKind::Build,
            operation_name: None,
            target: target.into(),
            source_commit: source_commit.into(),
            source_firmware: None,
            target_firmware: None,
            version_major: None,
            version_minor: None,
            version_patch: None,
            version_suffix: None,
            build_signature: None,
            force: false,
            no_rom_zip: false,
            status: JobStatus::Queued,
            queue_job_id: None,
            process_pid: None,
            return_code: None,
            error: None,
            log_path: None,
            artifact_path: None,
            reused_from_job_id: None,
            extra_mods_archive_path: None,
            extra_mods_modules_json: None,
            mods_disabled_json: None,
            debloat_disabled_json: None,
            debloat_add_system_json: None,
            debloat_add_product_json: None,
            ff_overrides_json: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// A `queued` operation job carrying a human-readable name for the UI.
    pub fn new_operation(
        target: impl Into<String>,
        source_commit: impl Into<String>,
        operation_name: impl Into<String>,
    ) -> Self {
        let mut job = Self::new_build(target, source_commit);
        job.kind = JobKind::Operation;
        job.operation_name = Some(operation_name.into());
        job
    }
}

/// `POST /jobs` request body. Absent fields fall back to on-disk defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildJobRequest {
    pub target: String,
    pub source_firmware: Option<String>,
    pub target_firmware: Option<String>,
    pub version_major: Option<i64>,
    pub version_minor: Option<i64>,
    pub version_patch: Option<i64>,
    pub version_suffix: Option<String>,
    pub extra_mods_upload_id: Option<String>,
    pub mods_disabled: Option<Vec<String>>,
    pub debloat_disabled: Option<Vec<String>>,
    pub debloat_add_system: Option<Vec<String>>,
    pub debloat_add_product: Option<Vec<String>>,
    pub ff_overrides: Option<std::collections::BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub no_rom_zip: bool,
}
