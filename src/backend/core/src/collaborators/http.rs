//! HTTP adapters for the platform's internal API and the similarity service.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{
    ApplicationRecorder, ApplicationSubmitter, JobCatalog, Notification, Notifier, ProfileDirectory,
    SimilarityModel, SubmissionError, SubmissionReceipt, SubmissionRequest,
};
use crate::config::CollaboratorConfig;
use crate::error::{AutoApplyError, Result};
use crate::jobs::{AutoApplyJob, ErrorType};
use crate::models::{CandidateProfile, JobPosting};

/// Response envelope used by the platform's internal API.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn into_data(self, service: &str) -> Result<Option<T>> {
        if self.success {
            Ok(self.data)
        } else {
            Err(AutoApplyError::external_service(
                service,
                self.error.unwrap_or_else(|| "Unknown error".into()),
            ))
        }
    }
}

/// Map a board response status to the failure taxonomy.
pub fn classify_status(status: StatusCode) -> ErrorType {
    match status.as_u16() {
        400 | 422 => ErrorType::Validation,
        403 | 451 => ErrorType::TosViolation,
        404 | 410 => ErrorType::JobClosed,
        408 => ErrorType::Timeout,
        429 => ErrorType::RateLimit,
        500..=599 => ErrorType::Network,
        _ => ErrorType::Unknown,
    }
}

fn classify_transport(error: &reqwest::Error) -> ErrorType {
    if error.is_timeout() {
        ErrorType::Timeout
    } else if error.is_connect() || error.is_request() {
        ErrorType::Network
    } else {
        ErrorType::Unknown
    }
}

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AutoApplyError::configuration(format!("Failed to create HTTP client: {}", e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Platform Client
// ═══════════════════════════════════════════════════════════════════════════════

/// Client for the platform's internal API: profiles, catalog, submission,
/// application records and notifications.
#[derive(Debug, Clone)]
pub struct PlatformClient {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
struct RecordBody<'a> {
    job: &'a AutoApplyJob,
    receipt: &'a SubmissionReceipt,
}

impl PlatformClient {
    pub fn new(base_url: &str, api_token: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    /// `None` when no platform URL is configured.
    pub fn from_config(config: &CollaboratorConfig) -> Result<Option<Self>> {
        config
            .platform_url
            .as_deref()
            .map(|url| Self::new(url, config.api_token.clone(), config.request_timeout))
            .transpose()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// GET returning `None` on 404.
    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let resp = self.request(Method::GET, path).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        let envelope: ApiResponse<T> = resp.json().await?;
        envelope.into_data("platform")
    }

    async fn post_unit<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let resp = self.request(Method::POST, path).json(body).send().await?;
        let resp = resp.error_for_status()?;
        let envelope: ApiResponse<serde_json::Value> = resp.json().await?;
        envelope.into_data("platform").map(|_| ())
    }
}

#[async_trait]
impl ProfileDirectory for PlatformClient {
    async fn profile(&self, user_id: &str) -> Result<Option<CandidateProfile>> {
        self.get_optional(&format!("/internal/profiles/{}", user_id)).await
    }
}

#[async_trait]
impl JobCatalog for PlatformClient {
    async fn posting(&self, job_id: &str) -> Result<Option<JobPosting>> {
        self.get_optional(&format!("/internal/jobs/{}", job_id)).await
    }
}

#[async_trait]
impl ApplicationSubmitter for PlatformClient {
    async fn submit(&self, request: &SubmissionRequest) -> std::result::Result<SubmissionReceipt, SubmissionError> {
        let resp = self
            .request(Method::POST, "/internal/applications/submit")
            .json(request)
            .send()
            .await
            .map_err(|e| SubmissionError::new(classify_transport(&e), e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), posting_id = %request.posting_id, "Submission rejected");
            return Err(SubmissionError::new(
                classify_status(status),
                format!("HTTP {}: {}", status.as_u16(), body),
            ));
        }

        let envelope: ApiResponse<SubmissionReceipt> = resp
            .json()
            .await
            .map_err(|e| SubmissionError::new(ErrorType::Unknown, format!("Malformed receipt: {}", e)))?;

        match (envelope.success, envelope.data) {
            (true, Some(receipt)) => Ok(receipt),
            (true, None) => Err(SubmissionError::new(ErrorType::Unknown, "Platform returned no receipt")),
            (false, _) => Err(SubmissionError::new(
                ErrorType::Unknown,
                envelope.error.unwrap_or_else(|| "Unknown error".into()),
            )),
        }
    }
}

#[async_trait]
impl ApplicationRecorder for PlatformClient {
    async fn record(&self, job: &AutoApplyJob, receipt: &SubmissionReceipt) -> Result<()> {
        self.post_unit("/internal/applications", &RecordBody { job, receipt }).await
    }
}

#[async_trait]
impl Notifier for PlatformClient {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        self.post_unit("/internal/notifications", notification).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Similarity Service
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct HttpSimilarityModel {
    client: Client,
    endpoint: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
struct SimilarityBody<'a> {
    a: &'a str,
    b: &'a str,
}

#[derive(Deserialize)]
struct SimilarityResponse {
    similarity: f64,
}

impl HttpSimilarityModel {
    pub fn new(base_url: &str, api_token: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: format!("{}/similarity", base_url.trim_end_matches('/')),
            api_token,
        })
    }

    pub fn from_config(config: &CollaboratorConfig) -> Result<Option<Self>> {
        config
            .similarity_url
            .as_deref()
            .map(|url| Self::new(url, config.api_token.clone(), config.request_timeout))
            .transpose()
    }
}

#[async_trait]
impl SimilarityModel for HttpSimilarityModel {
    async fn similarity(&self, a: &str, b: &str) -> Result<f64> {
        let mut request = self.client.post(&self.endpoint).json(&SimilarityBody { a, b });
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response: SimilarityResponse = request.send().await?.error_for_status()?.json().await?;
        Ok(response.similarity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (400, ErrorType::Validation),
            (422, ErrorType::Validation),
            (403, ErrorType::TosViolation),
            (451, ErrorType::TosViolation),
            (404, ErrorType::JobClosed),
            (410, ErrorType::JobClosed),
            (429, ErrorType::RateLimit),
            (502, ErrorType::Network),
            (418, ErrorType::Unknown),
        ];
        for (code, expected) in cases {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status), expected, "status {}", code);
        }
    }

    #[test]
    fn test_base_url_trimmed() {
        let client = PlatformClient::new("http://platform.local/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://platform.local");
    }

    #[test]
    fn test_from_config_without_url() {
        let config = CollaboratorConfig::default();
        assert!(PlatformClient::from_config(&config).unwrap().is_none());
        assert!(HttpSimilarityModel::from_config(&config).unwrap().is_none());
    }
}
