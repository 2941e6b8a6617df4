//! SQLite implementation of the `SettingsStore` port.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use uwb_core::error::StoreError;
use uwb_core::ports::SettingsStore;

/// SQLite implementation of the `SettingsStore` port.
pub struct SqliteSettingsStore {
    pool: SqlitePool,
}

impl SqliteSettingsStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsStore for SqliteSettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM app_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO app_settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM app_settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::setup_test_database;
    use uwb_core::ports::settings_keys;

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let store = SqliteSettingsStore::new(setup_test_database().await.unwrap());

        assert!(store.get(settings_keys::GIT_URL).await.unwrap().is_none());

        store
            .set(settings_keys::GIT_URL, "https://github.com/salvogiangri/UN1CA.git")
            .await
            .unwrap();
        assert_eq!(
            store.get(settings_keys::GIT_URL).await.unwrap().as_deref(),
            Some("https://github.com/salvogiangri/UN1CA.git")
        );

        // Overwrite, then delete back to the initial state.
        store.set(settings_keys::GIT_URL, "https://example.com/fork.git").await.unwrap();
        assert_eq!(
            store.get(settings_keys::GIT_URL).await.unwrap().as_deref(),
            Some("https://example.com/fork.git")
        );

        store.delete(settings_keys::GIT_URL).await.unwrap();
        assert!(store.get(settings_keys::GIT_URL).await.unwrap().is_none());
    }
}
