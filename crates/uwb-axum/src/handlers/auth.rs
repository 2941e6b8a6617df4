//! Login and password management.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};

use uwb_core::ports::settings_keys;

use crate::auth;
use crate::error::HttpError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

/// `POST /auth/login` -> `{token}`.
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<Value>, HttpError> {
    let settings = &state.worker.settings;
    let hash = settings.get(settings_keys::PASSWORD_HASH).await?.unwrap_or_default();
    let salt = settings.get(settings_keys::PASSWORD_SALT).await?.unwrap_or_default();

    if hash.is_empty() || salt.is_empty() {
        return Err(HttpError::bad_request("Authentication is disabled"));
    }
    if !auth::verify_password(&payload.password, &hash, &salt) {
        return Err(HttpError::Unauthorized("Invalid password".to_string()));
    }

    let token = auth::issue_token(&state).await;
    Ok(Json(json!({"token": token})))
}

#[derive(Deserialize)]
pub struct PasswordRequest {
    /// Empty or absent clears the password and disables auth globally.
    pub password: Option<String>,
}

/// `POST /auth/password`: set or clear the password.
pub async fn set_password(
    State(state): State<AppState>,
    Json(payload): Json<PasswordRequest>,
) -> Result<Json<Value>, HttpError> {
    let settings = &state.worker.settings;
    match payload.password.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        Some(password) => {
            let (hash, salt) = auth::hash_password(password);
            settings.set(settings_keys::PASSWORD_HASH, &hash).await?;
            settings.set(settings_keys::PASSWORD_SALT, &salt).await?;
            Ok(Json(json!({"auth_enabled": true})))
        }
        None => {
            settings.delete(settings_keys::PASSWORD_HASH).await?;
            settings.delete(settings_keys::PASSWORD_SALT).await?;
            Ok(Json(json!({"auth_enabled": false})))
        }
    }
}
