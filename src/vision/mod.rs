//! Image description providers.
//!
//! [`DescriptionProvider`] is the seam between the processor and whatever
//! turns pixels into text. [`IdeogramClient`] calls the Ideogram `describe`
//! endpoint; [`FallbackDescriber`] produces a metadata-only description when
//! no API key is configured and the fallback is enabled.

mod fallback;
mod ideogram;

pub use fallback::FallbackDescriber;
pub use ideogram::IdeogramClient;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::IDEOGRAM_API_KEY_ENV;
use crate::crypto::SecretKey;
use crate::db::IDEOGRAM_API_KEY;

/// An image that passed validation
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub filename: String,
    pub mime_type: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionSource {
    Ideogram,
    Fallback,
}

impl DescriptionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptionSource::Ideogram => "ideogram",
            DescriptionSource::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Description {
    pub text: String,
    pub confidence: Option<f64>,
    pub source: DescriptionSource,
}

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("No Ideogram API key configured")]
    MissingApiKey,

    #[error("Vision API request timed out")]
    Timeout,

    #[error("Vision API request failed: {0}")]
    Transport(String),

    #[error("Vision API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Vision API returned no description")]
    EmptyResponse,

    #[error("Invalid vision API response: {0}")]
    InvalidResponse(String),

    #[error("Failed to read API key setting: {0}")]
    KeyLookup(String),
}

impl From<reqwest::Error> for VisionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            VisionError::Timeout
        } else if e.is_decode() {
            VisionError::InvalidResponse(e.to_string())
        } else {
            VisionError::Transport(e.to_string())
        }
    }
}

#[async_trait]
pub trait DescriptionProvider: Send + Sync {
    async fn describe(&self, image: &ImageInput) -> Result<Description, VisionError>;
}

/// Resolves the Ideogram key per request so a key saved through the admin
/// settings takes effect without a restart.
///
/// Order: active `IDEOGRAM_API_KEY` setting, then the config value, then the
/// environment variable.
#[derive(Clone)]
pub struct ApiKeyResolver {
    db: Option<SqlitePool>,
    encryption_key: Option<SecretKey>,
    config_key: Option<String>,
}

impl ApiKeyResolver {
    pub fn new(
        db: Option<SqlitePool>,
        encryption_key: Option<SecretKey>,
        config_key: Option<String>,
    ) -> Self {
        Self {
            db,
            encryption_key,
            config_key,
        }
    }

    /// A resolver with a fixed key and no database lookup
    pub fn fixed(key: impl Into<String>) -> Self {
        Self::new(None, None, Some(key.into()))
    }

    pub async fn resolve(&self) -> Result<Option<String>, VisionError> {
        if let Some(db) = &self.db {
            let stored = crate::db::active_setting_value(db, IDEOGRAM_API_KEY, self.encryption_key.as_ref())
                .await
                .map_err(|e| VisionError::KeyLookup(e.to_string()))?;
            if stored.is_some() {
                return Ok(stored);
            }
        }

        if let Some(key) = self.config_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Ok(Some(key.clone()));
        }

        Ok(std::env::var(IDEOGRAM_API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty()))
    }
}

impl std::fmt::Debug for ApiKeyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyResolver")
            .field("uses_settings", &self.db.is_some())
            .field("config_key", &self.config_key.as_ref().map(|_| "****"))
            .finish()
    }
}
