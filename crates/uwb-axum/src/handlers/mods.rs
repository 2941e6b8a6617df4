//! Mod archive upload: stream the multipart body to disk in 1 MiB chunks,
//! validate the archive off the request thread, write the sidecar.

use axum::Json;
use axum::extract::{Multipart, State};
use axum::extract::multipart::Field;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;

use crate::error::HttpError;
use crate::state::AppState;
use crate::uploads::{self, UploadMeta};

/// `POST /mods/upload` (multipart field `file`).
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, HttpError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| HttpError::bad_request(e.to_string()))?
    {
        if field.name() == Some("file") {
            return store_and_validate(&state, field).await;
        }
    }
    Err(HttpError::bad_request("Missing file field"))
}

async fn store_and_validate(
    state: &AppState,
    mut field: Field<'_>,
) -> Result<Json<Value>, HttpError> {
    let data_dir = state.worker.config.data_dir.clone();
    let upload_id = uploads::new_upload_id();

    let original_name = field.file_name().unwrap_or("mods.bin").to_string();
    let archive_path = uploads::archive_path(&data_dir, &upload_id, &original_name);
    if let Some(parent) = archive_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| HttpError::Internal(e.to_string()))?;
    }

    // Multipart frames arrive in chunks already; buffer writes at 1 MiB.
    let file = tokio::fs::File::create(&archive_path)
        .await
        .map_err(|e| HttpError::Internal(e.to_string()))?;
    let mut writer = tokio::io::BufWriter::with_capacity(1024 * 1024, file);
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| HttpError::bad_request(e.to_string()))?
    {
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| HttpError::Internal(e.to_string()))?;
    }
    writer
        .flush()
        .await
        .map_err(|e| HttpError::Internal(e.to_string()))?;

    // Validation extracts to a scratch area; no sidecar is written on
    // failure, so a rejected upload leaves nothing claimable behind.
    let work_dir = uploads::uploads_dir(&data_dir).join(&upload_id);
    let archive_for_validation = archive_path.clone();
    let validated = tokio::task::spawn_blocking(move || {
        uwb_runtime::validate_mods_archive(&archive_for_validation, &work_dir)
    })
    .await
    .map_err(|e| HttpError::Internal(e.to_string()))?;

    let validated = match validated {
        Ok(validated) => validated,
        Err(error) => {
            let _ = tokio::fs::remove_file(&archive_path).await;
            let _ =
                tokio::fs::remove_dir_all(uploads::uploads_dir(&data_dir).join(&upload_id)).await;
            return Err(error.into());
        }
    };

    let meta = UploadMeta {
        used: false,
        archive_path: archive_path.to_string_lossy().into_owned(),
        modules: validated.modules,
    };
    uploads::save_meta(&data_dir, &upload_id, &meta)
        .await
        .map_err(|e| HttpError::Internal(e.to_string()))?;

    Ok(Json(json!({"upload_id": upload_id, "modules": meta.modules})))
}
