//! Bearer-token authentication.
//!
//! Passwords are hashed with PBKDF2-HMAC-SHA256 (120 000 iterations, 16-byte
//! random salt); hash and salt are stored base64-encoded in the settings
//! table. Login issues an opaque 128-bit token kept in the shared store with
//! a 7-day TTL. When no password hash is configured authentication is
//! disabled globally. Password material and tokens are never logged.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde_json::json;
use sha2::Sha256;

use uwb_core::ports::settings_keys;

use crate::error::HttpError;
use crate::state::AppState;

const PBKDF2_ITERATIONS: u32 = 120_000;
const SALT_LEN: usize = 16;
const TOKEN_TTL_SECS: u64 = 7 * 24 * 3600;
const TOKEN_PREFIX: &str = "un1ca:auth_tokens:";

/// Derive the PBKDF2 hash of `password` under `salt`.
fn derive(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut out);
    out
}

/// Hash a new password; returns `(hash_b64, salt_b64)`.
pub fn hash_password(password: &str) -> (String, String) {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let hash = derive(password, &salt);
    (BASE64.encode(hash), BASE64.encode(salt))
}

/// Constant-shape verification against the stored hash/salt pair.
pub fn verify_password(password: &str, hash_b64: &str, salt_b64: &str) -> bool {
    let (Ok(expected), Ok(salt)) = (BASE64.decode(hash_b64), BASE64.decode(salt_b64)) else {
        return false;
    };
    let actual = derive(password, &salt);
    // Length is fixed; compare without early exit.
    expected.len() == actual.len()
        && expected
            .iter()
            .zip(actual.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// True when a password hash is configured.
pub async fn auth_enabled(state: &AppState) -> bool {
    matches!(
        state.worker.settings.get(settings_keys::PASSWORD_HASH).await,
        Ok(Some(hash)) if !hash.is_empty()
    )
}

/// Issue a fresh token for a successfully verified login.
pub async fn issue_token(state: &AppState) -> String {
    let token = uuid::Uuid::new_v4().simple().to_string();
    state
        .worker
        .bus
        .set_json_ex(
            &format!("{TOKEN_PREFIX}{token}"),
            &json!({"issued_at": chrono::Utc::now().to_rfc3339()}),
            TOKEN_TTL_SECS,
        )
        .await;
    token
}

/// Check a presented token against the store.
pub async fn token_valid(state: &AppState, token: &str) -> bool {
    !token.is_empty()
        && state
            .worker
            .bus
            .get_json(&format!("{TOKEN_PREFIX}{token}"))
            .await
            .is_some()
}

fn bearer_from_headers(request: &Request) -> Option<String> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Middleware for the protected route tree. Disabled (pass-through) until a
/// password is configured.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, HttpError> {
    if !auth_enabled(&state).await {
        return Ok(next.run(request).await);
    }
    let token = bearer_from_headers(&request).unwrap_or_default();
    if token_valid(&state, &token).await {
        Ok(next.run(request).await)
    } else {
        Err(HttpError::Unauthorized("Missing or invalid token".to_string()))
    }
}

/// Token resolution for WebSocket routes: `Authorization` header or
/// `?token=` query. Returns whether the connection may proceed.
pub async fn ws_authorized(
    state: &AppState,
    headers: &axum::http::HeaderMap,
    token_query: Option<&str>,
) -> bool {
    if !auth_enabled(state).await {
        return true;
    }
    let header_token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    let token = if header_token.is_empty() {
        token_query.unwrap_or("")
    } else {
        header_token
    };
    token_valid(state, token).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_verifies() {
        let (hash, salt) = hash_password("hunter2");
        assert!(verify_password("hunter2", &hash, &salt));
        assert!(!verify_password("hunter3", &hash, &salt));
    }

    #[test]
    fn salts_are_random() {
        let (hash_a, salt_a) = hash_password("same");
        let (hash_b, salt_b) = hash_password("same");
        assert_ne!(salt_a, salt_b);
        assert_ne!(hash_a, hash_b);
    }

    #[test]
    fn malformed_stored_material_never_verifies() {
        assert!(!verify_password("x", "not-base64!!!", "also-not"));
    }
}
