#![deny(unused_crate_dependencies)]

pub mod config;
pub mod debloat;
pub mod error;
pub mod ff;
pub mod hints;
pub mod job;
pub mod mods;
pub mod ports;
pub mod progress;
pub mod signature;
pub mod workspace;

// Re-export commonly used types for convenience
pub use config::ServiceConfig;
pub use error::{CoreError, StoreError};
pub use job::{
    BuildJobRequest, JobKind, JobRecord, JobStatus, StopSignal, TERMINAL_STATUSES, new_job_id,
};
pub use ports::{Bus, JobStore, SettingsStore, settings_keys};
pub use progress::{
    BUILD_PROGRESS_CHANNEL, BUILD_PROGRESS_KEY, FIRMWARE_PROGRESS_CHANNEL, FIRMWARE_PROGRESS_KEY,
    ProgressPhase, ProgressStatus, ProgressUpdate, REPO_PROGRESS_CHANNEL, REPO_PROGRESS_KEY,
    RepoStage,
};
pub use signature::{BuildSignatureInputs, build_signature, payload_digest};
pub use workspace::{
    TargetDefaults, defaults_for_target, firmware_key_from_value, parse_model_csc,
    read_shell_var, resolve_workspace_root, safe_name, target_codenames, target_options,
};

// Silence unused dev-dependency warnings until we add more async port tests
#[cfg(test)]
use tokio_test as _;
