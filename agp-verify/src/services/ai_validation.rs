//! AI validation service client
//!
//! Scores an uploaded image for authenticity (`deepfake_score`) and visual
//! quality. Callers wrap every call in a timeout and treat any error as
//! "AI unavailable"; nothing here ever fails a submission.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::StageName;

const USER_AGENT: &str = concat!("agp-verify/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum AiValidationError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("API error {0}: {1}")]
    ApiError(u16, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Scoring timed out after {0:?}")]
    Timeout(Duration),

    #[error("AI validation service not configured")]
    NotConfigured,
}

/// Scores returned by the AI service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiScore {
    #[serde(alias = "deepfakeScore")]
    pub deepfake_score: f64,
    #[serde(alias = "visualQualityScore")]
    pub visual_quality_score: f64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// What the AI service is told about the image
#[derive(Debug, Clone, Serialize)]
pub struct ScoringContext {
    pub batch_id: Uuid,
    pub stage: StageName,
    pub farmer_id: String,
    pub crop_name: String,
}

#[async_trait]
pub trait AiValidator: Send + Sync {
    async fn score_image(&self, image_url: &str, context: &ScoringContext) -> Result<AiScore, AiValidationError>;
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    image_url: &'a str,
    #[serde(flatten)]
    context: &'a ScoringContext,
}

/// HTTP client for a remote AI validation service
pub struct HttpAiValidator {
    http_client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpAiValidator {
    /// `endpoint` receives `POST` with `{image_url, batch_id, stage, farmer_id, crop_name}`
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, AiValidationError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AiValidationError::NetworkError(e.to_string()))?;

        Ok(Self {
            http_client,
            endpoint: endpoint.into(),
            timeout,
        })
    }
}

#[async_trait]
impl AiValidator for HttpAiValidator {
    async fn score_image(&self, image_url: &str, context: &ScoringContext) -> Result<AiScore, AiValidationError> {
        tracing::debug!(image_url, stage = %context.stage, "Requesting AI validation");

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&ScoreRequest { image_url, context })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AiValidationError::Timeout(self.timeout)
                } else {
                    AiValidationError::NetworkError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AiValidationError::ApiError(status.as_u16(), error_text));
        }

        response
            .json::<AiScore>()
            .await
            .map_err(|e| AiValidationError::ParseError(e.to_string()))
    }
}

/// Stand-in used when no AI endpoint is configured: every image goes to a human
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableAiValidator;

#[async_trait]
impl AiValidator for UnavailableAiValidator {
    async fn score_image(&self, _image_url: &str, _context: &ScoringContext) -> Result<AiScore, AiValidationError> {
        Err(AiValidationError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_accepts_camel_case() {
        let score: AiScore =
            serde_json::from_str(r#"{"deepfakeScore": 0.12, "visualQualityScore": 0.88}"#).unwrap();
        assert_eq!(score.deepfake_score, 0.12);
        assert!(score.reason.is_none());
    }

    #[test]
    fn test_request_body_flattens_context() {
        let context = ScoringContext {
            batch_id: Uuid::nil(),
            stage: StageName::Germination,
            farmer_id: "farmer-1".to_string(),
            crop_name: "Maize".to_string(),
        };
        let body = serde_json::to_value(ScoreRequest {
            image_url: "https://img/1.jpg",
            context: &context,
        })
        .unwrap();
        assert_eq!(body["stage"], "GERMINATION");
        assert_eq!(body["image_url"], "https://img/1.jpg");
    }

    #[tokio::test]
    async fn test_unavailable_validator_always_fails() {
        let context = ScoringContext {
            batch_id: Uuid::new_v4(),
            stage: StageName::Sowing,
            farmer_id: "f".to_string(),
            crop_name: "Rice".to_string(),
        };
        let result = UnavailableAiValidator.score_image("file:///x.jpg", &context).await;
        assert!(matches!(result, Err(AiValidationError::NotConfigured)));
    }

    #[test]
    fn test_client_creation() {
        assert!(HttpAiValidator::new("http://localhost:9/score", Duration::from_secs(5)).is_ok());
    }
}
