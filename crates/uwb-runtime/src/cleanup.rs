//! Startup cleanup of stale per-build override leftovers.
//!
//! A crashed worker can leave `.uploaded-*` mod override directories and
//! per-job extract staging behind; both are only meaningful during a single
//! build, so the service removes them when it starts.

use std::path::Path;

use uwb_core::config::ServiceConfig;

/// Counters for the single startup log line.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub uploaded_mod_dirs: usize,
    pub tmp_extra_mods_dirs: usize,
}

fn remove_entry(path: &Path) {
    if path.is_dir() {
        let _ = std::fs::remove_dir_all(path);
    } else {
        let _ = std::fs::remove_file(path);
    }
}

/// Remove stale override directories; returns per-category counts.
pub fn cleanup_stale_build_overrides(config: &ServiceConfig) -> CleanupReport {
    let mut report = CleanupReport::default();

    let mods_dir = config.workspace_root.join("unica/mods");
    if let Ok(entries) = std::fs::read_dir(&mods_dir) {
        for entry in entries.filter_map(Result::ok) {
            if entry.file_name().to_string_lossy().starts_with(".uploaded-") {
                remove_entry(&entry.path());
                report.uploaded_mod_dirs += 1;
            }
        }
    }

    let tmp_root = config.tmp_extra_mods_dir();
    if let Ok(entries) = std::fs::read_dir(&tmp_root) {
        for entry in entries.filter_map(Result::ok) {
            remove_entry(&entry.path());
            report.tmp_extra_mods_dirs += 1;
        }
    }

    tracing::info!(
        uploaded_mod_dirs = report.uploaded_mod_dirs,
        tmp_extra_mods_dirs = report.tmp_extra_mods_dirs,
        "startup cleanup finished"
    );
    report
}
