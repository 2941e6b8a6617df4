//! Upload sidecars for mod archives.
//!
//! Each uploaded archive gets a random id, the stored file under
//! `<data>/uploads/` and a JSON sidecar carrying the parsed module list and
//! the single-use `used` flag (false -> true on first consumption).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use uwb_runtime::archive::ModuleManifest;

/// Sidecar contents for one upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadMeta {
    pub used: bool,
    pub archive_path: String,
    pub modules: Vec<ModuleManifest>,
}

pub fn new_upload_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn uploads_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("uploads")
}

fn meta_path(data_dir: &Path, upload_id: &str) -> PathBuf {
    uploads_dir(data_dir).join(format!("{upload_id}.json"))
}

/// Destination path for the raw archive, keeping the original extension so
/// format sniffing has a hint for humans reading the directory.
pub fn archive_path(data_dir: &Path, upload_id: &str, original_name: &str) -> PathBuf {
    let suffix = Path::new(original_name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_else(|| ".bin".to_string());
    uploads_dir(data_dir).join(format!("{upload_id}{suffix}"))
}

pub async fn load_meta(data_dir: &Path, upload_id: &str) -> Option<UploadMeta> {
    let raw = tokio::fs::read_to_string(meta_path(data_dir, upload_id)).await.ok()?;
    serde_json::from_str(&raw).ok()
}

pub async fn save_meta(
    data_dir: &Path,
    upload_id: &str,
    meta: &UploadMeta,
) -> std::io::Result<()> {
    let path = meta_path(data_dir, upload_id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_string(meta).map_err(std::io::Error::other)?;
    tokio::fs::write(path, body).await
}
