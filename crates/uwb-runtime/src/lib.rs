//! Process runtime and worker-side concerns: the shell supervisor, progress
//! trackers, archive validation, startup cleanup, git plumbing and the queue
//! worker that executes jobs.

pub mod archive;
pub mod cleanup;
pub mod git;
pub mod jobs;
pub mod supervisor;
pub mod tracker;
pub mod worker;

pub use archive::{ArchiveError, ValidatedArchive, validate_mods_archive};
pub use jobs::WorkerContext;
pub use supervisor::{ChunkConsumer, ShellJob};
#[cfg(unix)]
pub use supervisor::{liveness, signal_process_group};
pub use tracker::{FirmwareProgressTracker, RepoCommandConsumer, parse_progress, to_bytes};
pub use worker::{run_builds_worker, run_controls_worker};
