use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable holding the vision provider key when neither the
/// settings table nor the config file provides one.
pub const IDEOGRAM_API_KEY_ENV: &str = "IDEOGRAM_API_KEY";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub uploads: UploadConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory with the built frontend, served as SPA fallback when present
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
    /// Allowed CORS origins. Empty means same-origin only.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            api_port: default_api_port(),
            data_dir: default_data_dir(),
            static_dir: default_static_dir(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static/dist")
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Email of the bootstrap admin ensured at startup
    #[serde(default = "default_admin_email")]
    pub admin_email: String,
    /// Password of the bootstrap admin. No admin is created when unset.
    #[serde(default)]
    pub admin_password: Option<String>,
    /// Session lifetime in hours
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
    /// Name of the session cookie set on login
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Mark the session cookie `Secure`
    #[serde(default)]
    pub secure_cookies: bool,
    /// Secret used to encrypt API keys stored in the settings table
    #[serde(default)]
    pub encryption_key: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_email: default_admin_email(),
            admin_password: None,
            session_ttl_hours: default_session_ttl_hours(),
            cookie_name: default_cookie_name(),
            secure_cookies: false,
            encryption_key: None,
        }
    }
}

fn default_admin_email() -> String {
    "admin@picscribe.local".to_string()
}

fn default_session_ttl_hours() -> i64 {
    24 * 7
}

fn default_cookie_name() -> String {
    "picscribe_session".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    /// Base URL of the Ideogram API
    #[serde(default = "default_vision_base_url")]
    pub base_url: String,
    /// API key; the settings table and `IDEOGRAM_API_KEY` take part in resolution
    #[serde(default)]
    pub api_key: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_vision_timeout")]
    pub timeout_secs: u64,
    /// Produce a metadata-only description when no API key is configured
    #[serde(default)]
    pub fallback_enabled: bool,
    /// Confidence recorded for provider descriptions (Ideogram returns none)
    #[serde(default = "default_provider_confidence")]
    pub default_confidence: f64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            base_url: default_vision_base_url(),
            api_key: None,
            timeout_secs: default_vision_timeout(),
            fallback_enabled: false,
            default_confidence: default_provider_confidence(),
        }
    }
}

fn default_vision_base_url() -> String {
    "https://api.ideogram.ai".to_string()
}

fn default_vision_timeout() -> u64 {
    60
}

fn default_provider_confidence() -> f64 {
    0.95
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Maximum size of a single image in bytes (default: 10 MiB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
    /// Accepted MIME types
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            allowed_types: default_allowed_types(),
        }
    }
}

fn default_max_file_size() -> usize {
    10 * 1024 * 1024
}

fn default_allowed_types() -> Vec<String> {
    ["image/jpeg", "image/png", "image/webp", "image/gif"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Maximum number of files accepted in one batch request
    #[serde(default = "default_max_files_per_batch")]
    pub max_files_per_batch: usize,
    /// Chunk size in concurrent mode
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// In-flight window inside a chunk in concurrent mode
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_files_per_batch: default_max_files_per_batch(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_max_files_per_batch() -> usize {
    50
}

fn default_batch_size() -> usize {
    10
}

fn default_concurrency() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreditsConfig {
    /// Credits granted as a bonus on registration
    #[serde(default = "default_signup_bonus")]
    pub signup_bonus: i64,
    /// Credits consumed per successful description
    #[serde(default = "default_credits_per_image")]
    pub credits_per_image: i64,
    /// Packages offered for manual purchase
    #[serde(default = "default_packages")]
    pub packages: Vec<CreditPackage>,
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            signup_bonus: default_signup_bonus(),
            credits_per_image: default_credits_per_image(),
            packages: default_packages(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, PartialEq)]
pub struct CreditPackage {
    pub name: String,
    pub credits: i64,
    pub price: f64,
}

fn default_signup_bonus() -> i64 {
    5
}

fn default_credits_per_image() -> i64 {
    1
}

fn default_packages() -> Vec<CreditPackage> {
    vec![
        CreditPackage {
            name: "Starter".to_string(),
            credits: 50,
            price: 5.0,
        },
        CreditPackage {
            name: "Pro".to_string(),
            credits: 250,
            price: 20.0,
        },
        CreditPackage {
            name: "Studio".to_string(),
            credits: 1000,
            price: 70.0,
        },
    ]
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_requests")]
    pub api_requests_per_window: u32,
    #[serde(default = "default_auth_requests")]
    pub auth_requests_per_window: u32,
    #[serde(default = "default_describe_requests")]
    pub describe_requests_per_window: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Seconds between cleanup sweeps of stale limiter entries and sessions
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_requests_per_window: default_api_requests(),
            auth_requests_per_window: default_auth_requests(),
            describe_requests_per_window: default_describe_requests(),
            window_seconds: default_window_seconds(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_api_requests() -> u32 {
    100
}

fn default_auth_requests() -> u32 {
    20
}

fn default_describe_requests() -> u32 {
    30
}

fn default_window_seconds() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml(&content)?
        } else {
            info!("No config file found, using defaults");
            Config::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse configuration file")
    }

    /// Secrets may come from the environment instead of the config file.
    fn apply_env_overrides(&mut self) {
        if let Ok(password) = std::env::var("PICSCRIBE_ADMIN_PASSWORD") {
            self.auth.admin_password = Some(password);
        }
        if let Ok(key) = std::env::var("PICSCRIBE_ENCRYPTION_KEY") {
            self.auth.encryption_key = Some(key);
        }
        if self.vision.api_key.is_none() {
            self.vision.api_key = std::env::var(IDEOGRAM_API_KEY_ENV)
                .ok()
                .filter(|k| !k.trim().is_empty());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch.batch_size == 0 {
            anyhow::bail!("batch.batch_size must be at least 1");
        }
        if self.batch.concurrency == 0 {
            anyhow::bail!("batch.concurrency must be at least 1");
        }
        if self.batch.max_files_per_batch == 0 {
            anyhow::bail!("batch.max_files_per_batch must be at least 1");
        }
        if self.credits.credits_per_image < 1 {
            anyhow::bail!("credits.credits_per_image must be at least 1");
        }
        if self.credits.signup_bonus < 0 {
            anyhow::bail!("credits.signup_bonus cannot be negative");
        }
        if self.uploads.max_file_size == 0 {
            anyhow::bail!("uploads.max_file_size must be greater than 0");
        }
        Ok(())
    }

    /// Upper bound for a multipart batch body
    pub fn max_body_size(&self) -> usize {
        self.uploads
            .max_file_size
            .saturating_mul(self.batch.max_files_per_batch)
            .saturating_add(1024 * 1024)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            vision: VisionConfig::default(),
            uploads: UploadConfig::default(),
            batch: BatchConfig::default(),
            credits: CreditsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_batch_window() {
        let config = Config::default();
        assert_eq!(config.batch.batch_size, 10);
        assert_eq!(config.batch.concurrency, 5);
        assert_eq!(config.uploads.max_file_size, 10 * 1024 * 1024);
        assert_eq!(config.credits.credits_per_image, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [server]
            api_port = 9000

            [credits]
            signup_bonus = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.server.api_port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.credits.signup_bonus, 20);
        assert_eq!(config.credits.packages.len(), 3);
        assert!(!config.vision.fallback_enabled);
    }

    #[test]
    fn test_invalid_batch_settings_rejected() {
        let mut config = Config::default();
        config.batch.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("picscribe.toml");
        std::fs::write(
            &path,
            r#"
            [vision]
            fallback_enabled = true
            timeout_secs = 5
            "#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert!(config.vision.fallback_enabled);
        assert_eq!(config.vision.timeout_secs, 5);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load(Path::new("/nonexistent/picscribe.toml")).unwrap();
        assert_eq!(config.server.api_port, 8080);
    }

    #[test]
    fn test_example_config_parses() {
        let config = Config::from_toml(include_str!("../../picscribe.example.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.credits.packages.len(), 2);
        assert_eq!(config.server.cors_origins, vec!["http://localhost:5173".to_string()]);
        assert!(config.auth.admin_password.is_none());
    }

    #[test]
    fn test_max_body_size_covers_full_batch() {
        let config = Config::default();
        assert!(config.max_body_size() > config.uploads.max_file_size * 50);
    }
}
