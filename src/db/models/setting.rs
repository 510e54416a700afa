//! Runtime settings, mostly third-party API keys.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::crypto::{self, SecretKey};

/// Category whose values are encrypted at rest and masked in responses
pub const API_KEYS_CATEGORY: &str = "api_keys";

/// Settings key of the vision provider API key
pub const IDEOGRAM_API_KEY: &str = "IDEOGRAM_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub category: String,
    pub is_active: bool,
    pub updated_at: String,
}

impl Setting {
    pub fn is_secret(&self) -> bool {
        self.category == API_KEYS_CATEGORY
    }
}

/// Setting as exposed over the API. Secret values are masked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettingResponse {
    pub key: String,
    pub value: String,
    pub category: String,
    pub is_active: bool,
    pub updated_at: String,
}

impl SettingResponse {
    /// Build the response view; `plaintext` is the decrypted value for secrets.
    pub fn from_setting(setting: Setting, plaintext: Option<&str>) -> Self {
        let value = if setting.is_secret() {
            crypto::mask_secret(plaintext.unwrap_or(&setting.value))
        } else {
            setting.value.clone()
        };
        Self {
            key: setting.key,
            value,
            category: setting.category,
            is_active: setting.is_active,
            updated_at: setting.updated_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpsertSettingRequest {
    pub value: String,
    pub category: Option<String>,
    pub is_active: Option<bool>,
}

pub async fn list_settings(db: &SqlitePool) -> Result<Vec<Setting>, sqlx::Error> {
    sqlx::query_as::<_, Setting>("SELECT * FROM settings ORDER BY category, key")
        .fetch_all(db)
        .await
}

pub async fn find_setting(db: &SqlitePool, key: &str) -> Result<Option<Setting>, sqlx::Error> {
    sqlx::query_as::<_, Setting>("SELECT * FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await
}

/// Insert or replace a setting. Values in [`API_KEYS_CATEGORY`] are sealed
/// when an encryption key is configured.
pub async fn upsert_setting(
    db: &SqlitePool,
    key: &str,
    request: &UpsertSettingRequest,
    encryption_key: Option<&SecretKey>,
) -> anyhow::Result<Setting> {
    let category = request
        .category
        .clone()
        .unwrap_or_else(|| default_category(key).to_string());
    let stored_value = if category == API_KEYS_CATEGORY {
        crypto::encrypt_if_key_available(&request.value, encryption_key)?
    } else {
        request.value.clone()
    };

    sqlx::query(
        "INSERT INTO settings (key, value, category, is_active, updated_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            category = excluded.category,
            is_active = excluded.is_active,
            updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(&stored_value)
    .bind(&category)
    .bind(request.is_active.unwrap_or(true))
    .bind(crate::db::now())
    .execute(db)
    .await?;

    let setting = find_setting(db, key)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Setting {} vanished after upsert", key))?;
    Ok(setting)
}

pub async fn delete_setting(db: &SqlitePool, key: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM settings WHERE key = ?")
        .bind(key)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Plaintext value of an active setting, `None` when missing, inactive or empty.
pub async fn active_setting_value(
    db: &SqlitePool,
    key: &str,
    encryption_key: Option<&SecretKey>,
) -> anyhow::Result<Option<String>> {
    let setting = sqlx::query_as::<_, Setting>("SELECT * FROM settings WHERE key = ? AND is_active = 1")
        .bind(key)
        .fetch_optional(db)
        .await?;

    match setting {
        Some(s) => {
            let value = crypto::decrypt_if_encrypted(&s.value, encryption_key)?;
            Ok(Some(value).filter(|v| !v.trim().is_empty()))
        }
        None => Ok(None),
    }
}

fn default_category(key: &str) -> &'static str {
    if key.ends_with("_API_KEY") {
        API_KEYS_CATEGORY
    } else {
        "general"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn request(value: &str) -> UpsertSettingRequest {
        UpsertSettingRequest {
            value: value.to_string(),
            category: None,
            is_active: None,
        }
    }

    #[tokio::test]
    async fn test_api_key_is_encrypted_at_rest() {
        let pool = init_memory().await.unwrap();
        let key = crypto::derive_key("settings-test");

        let stored = upsert_setting(&pool, IDEOGRAM_API_KEY, &request("ideo_secret_9876"), Some(&key))
            .await
            .unwrap();
        assert_eq!(stored.category, API_KEYS_CATEGORY);
        assert!(crypto::is_encrypted(&stored.value));

        let value = active_setting_value(&pool, IDEOGRAM_API_KEY, Some(&key)).await.unwrap();
        assert_eq!(value.as_deref(), Some("ideo_secret_9876"));
    }

    #[tokio::test]
    async fn test_inactive_setting_is_ignored() {
        let pool = init_memory().await.unwrap();
        upsert_setting(
            &pool,
            IDEOGRAM_API_KEY,
            &UpsertSettingRequest {
                value: "k".to_string(),
                category: None,
                is_active: Some(false),
            },
            None,
        )
        .await
        .unwrap();

        assert!(active_setting_value(&pool, IDEOGRAM_API_KEY, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_delete_removes() {
        let pool = init_memory().await.unwrap();
        upsert_setting(&pool, "SITE_NAME", &request("one"), None).await.unwrap();
        let updated = upsert_setting(&pool, "SITE_NAME", &request("two"), None).await.unwrap();
        assert_eq!(updated.value, "two");
        assert_eq!(updated.category, "general");
        assert_eq!(list_settings(&pool).await.unwrap().len(), 1);

        assert!(delete_setting(&pool, "SITE_NAME").await.unwrap());
        assert!(!delete_setting(&pool, "SITE_NAME").await.unwrap());
    }

    #[test]
    fn test_response_masks_secrets() {
        let setting = Setting {
            key: IDEOGRAM_API_KEY.to_string(),
            value: "ENC:xyz".to_string(),
            category: API_KEYS_CATEGORY.to_string(),
            is_active: true,
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        };
        let response = SettingResponse::from_setting(setting, Some("ideo_live_abcd"));
        assert_eq!(response.value, "****abcd");
    }
}
