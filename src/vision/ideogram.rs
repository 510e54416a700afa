//! Client for the Ideogram `describe` endpoint.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{
    ApiKeyResolver, Description, DescriptionProvider, DescriptionSource, FallbackDescriber,
    ImageInput, VisionError,
};
use crate::api::metrics::record_vision_request;
use crate::config::VisionConfig;

/// Longest error body kept in a [`VisionError::Api`]
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    #[serde(default)]
    descriptions: Vec<DescribeItem>,
}

#[derive(Debug, Deserialize)]
struct DescribeItem {
    #[serde(default)]
    text: Option<String>,
}

pub struct IdeogramClient {
    http: reqwest::Client,
    endpoint: String,
    keys: ApiKeyResolver,
    confidence: f64,
    fallback: Option<FallbackDescriber>,
}

impl IdeogramClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        keys: ApiKeyResolver,
        confidence: f64,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("picscribe/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            endpoint: format!("{}/describe", base_url.trim_end_matches('/')),
            keys,
            confidence,
            fallback: None,
        })
    }

    pub fn from_config(config: &VisionConfig, keys: ApiKeyResolver) -> anyhow::Result<Self> {
        let client = Self::new(
            &config.base_url,
            Duration::from_secs(config.timeout_secs),
            keys,
            config.default_confidence,
        )?;
        Ok(if config.fallback_enabled {
            client.with_fallback(FallbackDescriber::default())
        } else {
            client
        })
    }

    /// Use `fallback` whenever no API key resolves
    pub fn with_fallback(mut self, fallback: FallbackDescriber) -> Self {
        self.fallback = Some(fallback);
        self
    }

    async fn call(&self, api_key: &str, image: &ImageInput) -> Result<Description, VisionError> {
        let part = Part::stream(reqwest::Body::from(image.data.clone()))
            .file_name(image.filename.clone())
            .mime_str(&image.mime_type)
            .map_err(|e| VisionError::Transport(format!("invalid mime type: {}", e)))?;
        let form = Form::new().part("image_file", part);

        let response = self
            .http
            .post(&self.endpoint)
            .header("Api-Key", api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(VisionError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: DescribeResponse = response.json().await?;
        let text = parsed
            .descriptions
            .into_iter()
            .filter_map(|d| d.text)
            .map(|t| t.trim().to_string())
            .find(|t| !t.is_empty())
            .ok_or(VisionError::EmptyResponse)?;

        Ok(Description {
            text,
            confidence: Some(self.confidence),
            source: DescriptionSource::Ideogram,
        })
    }
}

#[async_trait]
impl DescriptionProvider for IdeogramClient {
    async fn describe(&self, image: &ImageInput) -> Result<Description, VisionError> {
        let Some(api_key) = self.keys.resolve().await? else {
            return match &self.fallback {
                Some(fallback) => {
                    debug!(filename = %image.filename, "No API key, using fallback describer");
                    fallback.describe(image).await
                }
                None => Err(VisionError::MissingApiKey),
            };
        };

        let start = Instant::now();
        let result = self.call(&api_key, image).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(_) => {
                record_vision_request("success", elapsed);
                debug!(
                    filename = %image.filename,
                    bytes = image.data.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Ideogram description received"
                );
            }
            Err(e) => {
                record_vision_request("error", elapsed);
                warn!(
                    filename = %image.filename,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Ideogram describe failed"
                );
            }
        }

        result
    }
}
