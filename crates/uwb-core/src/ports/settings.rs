//! Settings store port: a small key/value table for repo configuration and
//! auth material. Values are opaque strings; the git token and password
//! material are never logged.

use async_trait::async_trait;

use crate::error::StoreError;

/// Well-known settings keys.
pub mod settings_keys {
    pub const GIT_URL: &str = "git_url";
    pub const GIT_REF: &str = "git_ref";
    pub const GIT_USERNAME: &str = "git_username";
    pub const GIT_TOKEN: &str = "git_token";
    pub const PASSWORD_HASH: &str = "password_hash";
    pub const PASSWORD_SALT: &str = "password_salt";
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Create on first write, overwrite afterwards.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
