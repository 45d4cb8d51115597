//! Company Metrics Consumer Configuration
//!
//! Layers, lowest precedence first:
//! - Built-in defaults
//! - Optional TOML file
//! - `CM_*` environment variables

use std::path::Path;
use std::time::Duration;

use cm_common::DeltaType;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Sections
// ============================================================================

/// Downstream API endpoints and HTTP client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the company metrics API (recalculate endpoint)
    pub metrics_api_url: String,
    /// Base URL used for charge existence reads
    pub charges_api_url: String,
    pub api_key: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            metrics_api_url: "http://localhost:8080".to_string(),
            charges_api_url: "http://localhost:8080".to_string(),
            api_key: None,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl ApiConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Retry and dead-letter topic policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total delivery attempts, including the first
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub retry_suffix: String,
    pub error_suffix: String,
    pub invalid_suffix: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_ms: 100,
            retry_suffix: "retry".to_string(),
            error_suffix: "error".to_string(),
            invalid_suffix: "invalid".to_string(),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Binds an inbound topic to the delta type its messages carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicBinding {
    pub topic: String,
    pub delta_type: DeltaType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub concurrency: u32,
    pub topics: Vec<TopicBinding>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        let bind = |topic: &str, delta_type| TopicBinding {
            topic: topic.to_string(),
            delta_type,
        };
        Self {
            group_id: "company-metrics-consumer".to_string(),
            concurrency: 10,
            topics: vec![
                bind("stream-company-charges", DeltaType::Charges),
                bind("stream-company-officers", DeltaType::Officers),
                bind("stream-company-psc", DeltaType::Pscs),
                bind("stream-psc-statements", DeltaType::PscStatements),
                bind("stream-company-registers", DeltaType::Registers),
            ],
        }
    }
}

impl ConsumerConfig {
    pub fn delta_type_for(&self, topic: &str) -> Option<DeltaType> {
        self.topics
            .iter()
            .find(|b| b.topic == topic)
            .map(|b| b.delta_type)
    }
}

// ============================================================================
// Root
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub retry: RetryConfig,
    pub consumer: ConsumerConfig,
}

impl AppConfig {
    /// Load defaults, then the TOML file if given, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "Loading configuration file");
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `CM_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CM_METRICS_API_URL") {
            self.api.metrics_api_url = v;
        }
        if let Some(v) = lookup("CM_CHARGES_API_URL") {
            self.api.charges_api_url = v;
        }
        if let Some(v) = lookup("CM_API_KEY") {
            self.api.api_key = Some(v);
        }
        if let Some(v) = lookup("CM_GROUP_ID") {
            self.consumer.group_id = v;
        }
        if let Some(v) = lookup("CM_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env("CM_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("CM_BACKOFF_MS") {
            self.retry.backoff_ms = parse_env("CM_BACKOFF_MS", &v)?;
        }
        if let Some(v) = lookup("CM_CONCURRENCY") {
            self.consumer.concurrency = parse_env("CM_CONCURRENCY", &v)?;
        }
        debug!(
            group_id = %self.consumer.group_id,
            max_attempts = self.retry.max_attempts,
            concurrency = self.consumer.concurrency,
            "Applied environment overrides"
        );
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.api.metrics_api_url.trim().is_empty() {
            return Err(ConfigError::Validation("api.metrics_api_url must not be empty".into()));
        }
        if self.api.charges_api_url.trim().is_empty() {
            return Err(ConfigError::Validation("api.charges_api_url must not be empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation("retry.max_attempts must be at least 1".into()));
        }
        if self.consumer.concurrency == 0 {
            return Err(ConfigError::Validation("consumer.concurrency must be at least 1".into()));
        }
        if self.consumer.group_id.trim().is_empty() {
            return Err(ConfigError::Validation("consumer.group_id must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}
