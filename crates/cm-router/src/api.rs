//! Downstream API client
//!
//! Two calls leave this process:
//! - `POST /company/{company_number}/metrics/recalculate` on the metrics API
//! - `GET {resource_uri}` on the charges API, to confirm a charge exists

use std::time::Duration;

use async_trait::async_trait;
use cm_common::RecalculateRequest;
use cm_config::ApiConfig;
use reqwest::{header, StatusCode, Url};
use thiserror::Error;
use tracing::{debug, warn};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Failure reported by the downstream API client
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request could not be built from its arguments
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    /// The target URI was rejected before sending
    #[error("URI validation failed: {0}")]
    UriValidation(String),

    /// The API answered with a non-2xx status
    #[error("API responded with status {status}: {message}")]
    Response { status: u16, message: String },

    /// No response (connect failure, timeout)
    #[error("Transport error: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Response { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn response(status: u16, message: impl Into<String>) -> Self {
        Self::Response {
            status,
            message: message.into(),
        }
    }
}

/// Outcome of a charge existence read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeLookup {
    Found,
    NotFound,
}

#[async_trait]
pub trait MetricsApi: Send + Sync {
    async fn post_recalculate(
        &self,
        company_number: &str,
        request: &RecalculateRequest,
        context_id: &str,
    ) -> Result<(), ApiError>;

    async fn get_charge(&self, resource_uri: &str, context_id: &str) -> Result<ChargeLookup, ApiError>;
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpMetricsApiConfig {
    pub metrics_api_url: String,
    pub charges_api_url: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpMetricsApiConfig {
    fn default() -> Self {
        Self::from(&ApiConfig::default())
    }
}

impl From<&ApiConfig> for HttpMetricsApiConfig {
    fn from(config: &ApiConfig) -> Self {
        Self {
            metrics_api_url: config.metrics_api_url.clone(),
            charges_api_url: config.charges_api_url.clone(),
            api_key: config.api_key.clone(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
        }
    }
}

/// reqwest-backed implementation of [`MetricsApi`]
pub struct HttpMetricsApi {
    config: HttpMetricsApiConfig,
    client: reqwest::Client,
    metrics_base: Url,
    charges_base: Url,
}

impl HttpMetricsApi {
    pub fn new(config: HttpMetricsApiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        let metrics_base = Url::parse(&config.metrics_api_url)?;
        let charges_base = Url::parse(&config.charges_api_url)?;

        Ok(Self {
            config,
            client,
            metrics_base,
            charges_base,
        })
    }

    fn resolve(base: &Url, path: &str) -> Result<Url, ApiError> {
        if !path.starts_with('/') {
            return Err(ApiError::UriValidation(format!(
                "URI must be an absolute path: {}",
                path
            )));
        }
        let url = base
            .join(path)
            .map_err(|e| ApiError::UriValidation(format!("{}: {}", path, e)))?;
        // Scheme-relative paths ("//host/...") would leave the configured API
        if url.origin() != base.origin() {
            return Err(ApiError::UriValidation(format!(
                "URI resolves outside {}: {}",
                base, path
            )));
        }
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder, context_id: &str) -> reqwest::RequestBuilder {
        let request = request.header(REQUEST_ID_HEADER, context_id);
        match self.config.api_key {
            Some(ref key) => request.header(header::AUTHORIZATION, key),
            None => request,
        }
    }

    async fn error_from(response: reqwest::Response) -> ApiError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        ApiError::response(status.as_u16(), body)
    }
}

fn map_send_error(e: reqwest::Error) -> ApiError {
    if e.is_builder() {
        ApiError::IllegalArgument(e.to_string())
    } else {
        ApiError::Transport(e.to_string())
    }
}

#[async_trait]
impl MetricsApi for HttpMetricsApi {
    async fn post_recalculate(
        &self,
        company_number: &str,
        request: &RecalculateRequest,
        context_id: &str,
    ) -> Result<(), ApiError> {
        if company_number.is_empty() {
            return Err(ApiError::IllegalArgument("company number must not be empty".into()));
        }
        let path = format!("/company/{}/metrics/recalculate", company_number);
        let url = Self::resolve(&self.metrics_base, &path)?;
        debug!(url = %url, context_id = %context_id, "Posting metrics recalculation");

        let response = self
            .authorize(self.client.post(url).json(request), context_id)
            .send()
            .await
            .map_err(map_send_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from(response).await)
        }
    }

    async fn get_charge(&self, resource_uri: &str, context_id: &str) -> Result<ChargeLookup, ApiError> {
        let url = Self::resolve(&self.charges_base, resource_uri)?;
        debug!(url = %url, context_id = %context_id, "Checking charge existence");

        let response = self
            .authorize(self.client.get(url), context_id)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(ChargeLookup::NotFound);
        }
        if !status.is_success() {
            return Err(Self::error_from(response).await);
        }

        // A 2xx with no charge body counts as not found
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let trimmed = body.trim();
        if trimmed.is_empty() || trimmed == "null" {
            warn!(resource_uri = %resource_uri, status = status.as_u16(), "Charge read returned an empty body");
            return Ok(ChargeLookup::NotFound);
        }
        Ok(ChargeLookup::Found)
    }
}
