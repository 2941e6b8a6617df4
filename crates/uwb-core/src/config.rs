//! Service configuration from environment variables.
//!
//! The binary loads `.env` before constructing this, so deployment can use
//! either real environment variables or an env file.

use std::env;
use std::path::PathBuf;

/// Runtime configuration shared by the front end and the workers.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Root of the ROM build tree (contains `target/`, `unica/`, `out/`).
    pub workspace_root: PathBuf,
    /// Artifact/firmware output tree, normally `<workspace_root>/out`.
    pub out_dir: PathBuf,
    /// Service-private data directory (uploads, temp staging, SQLite).
    pub data_dir: PathBuf,
    /// Job log directory.
    pub logs_dir: PathBuf,
    pub redis_url: String,
    pub database_url: String,
    pub bind_addr: String,
    /// Comma-separated allowed origins, `*` for any.
    pub cors_origins: String,
    /// Fallback short commit when the build tree has no git metadata.
    pub source_commit: String,
    pub repo_url_default: String,
    pub repo_ref_default: String,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let workspace_root =
            PathBuf::from(var_or("UWB_WORKSPACE_ROOT", "/workspace"));
        let out_dir = env::var("UWB_OUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| workspace_root.join("out"));
        let data_dir = PathBuf::from(var_or("UWB_DATA_DIR", "/data"));
        let logs_dir = env::var("UWB_LOGS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("logs"));

        Self {
            workspace_root,
            out_dir,
            logs_dir,
            redis_url: var_or("UWB_REDIS_URL", "redis://redis:6379/0"),
            database_url: env::var("UWB_DATABASE_URL").unwrap_or_else(|_| {
                format!("sqlite://{}", data_dir.join("app.db").display())
            }),
            bind_addr: var_or("UWB_BIND_ADDR", "0.0.0.0:8000"),
            cors_origins: var_or("UWB_CORS_ORIGINS", "*"),
            source_commit: var_or("UWB_SOURCE_COMMIT", "unknown"),
            repo_url_default: var_or(
                "UWB_REPO_URL",
                "https://github.com/salvogiangri/UN1CA.git",
            ),
            repo_ref_default: var_or("UWB_REPO_REF", "sixteen"),
            data_dir,
        }
    }

    /// Uploaded mod archives and their sidecar metadata.
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    /// Per-job staging area for extracted extra mods.
    pub fn tmp_extra_mods_dir(&self) -> PathBuf {
        self.data_dir.join("tmp-extra-mods")
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}
