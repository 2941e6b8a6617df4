//! Worker-side job handlers and the context they share.

pub mod build;
pub mod operation;
pub mod repo;
pub mod stop;

use std::sync::Arc;

use uwb_broker::{BuildProgressStore, FirmwareProgressStore, JobQueue, RepoProgressStore};
use uwb_core::config::ServiceConfig;
use uwb_core::ports::{Bus, JobStore, SettingsStore};

/// Worker dispatch-table function names. The queue carries these strings, so
/// they are part of the wire contract between the front end and workers.
pub mod functions {
    pub const BUILD: &str = "build";
    pub const EXTRACT_FW: &str = "extract_fw";
    pub const DELETE_FW: &str = "delete_fw";
    pub const REPO_CLONE: &str = "repo_clone";
    pub const REPO_PULL: &str = "repo_pull";
    pub const REPO_SUBMODULES: &str = "repo_submodules";
    pub const REPO_DELETE: &str = "repo_delete";
    pub const STOP_JOB: &str = "stop_job";
}

/// Everything a job handler needs; shared by the worker roles and (for
/// enqueueing and progress reads) the HTTP front end.
pub struct WorkerContext {
    pub config: ServiceConfig,
    pub jobs: Arc<dyn JobStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub bus: Arc<dyn Bus>,
    pub queue: JobQueue,
    pub firmware_progress: FirmwareProgressStore,
    pub build_progress: BuildProgressStore,
    pub repo_progress: RepoProgressStore,
}

impl WorkerContext {
    pub fn new(
        config: ServiceConfig,
        jobs: Arc<dyn JobStore>,
        settings: Arc<dyn SettingsStore>,
        bus: Arc<dyn Bus>,
    ) -> Self {
        Self {
            queue: JobQueue::new(bus.clone()),
            firmware_progress: FirmwareProgressStore::new(bus.clone()),
            build_progress: BuildProgressStore::new(bus.clone()),
            repo_progress: RepoProgressStore::new(bus.clone()),
            config,
            jobs,
            settings,
            bus,
        }
    }

    /// Log file path for a job, named after its sanitized target/operation.
    pub fn log_path(&self, name: &str, job_id: &str) -> std::path::PathBuf {
        let safe = uwb_core::workspace::safe_name(name);
        let safe = if safe.is_empty() { "job".to_string() } else { safe };
        self.config.logs_dir.join(format!("{safe}-{job_id}.log"))
    }
}

/// Quote a string for safe interpolation into a `bash -lc` script.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_survives_embedded_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
        assert_eq!(shell_quote(""), "''");
    }
}
