//! Certificate issuer adapters
//!
//! The transport is not idempotent: a second call for the same batch may mint
//! a second certificate. The certificate gate guarantees a single call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const USER_AGENT: &str = concat!("agp-verify/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Issuer error {0}: {1}")]
    ApiError(u16, String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Batch facts written onto the certificate
#[derive(Debug, Clone, Serialize)]
pub struct CertificateRequest {
    pub batch_id: Uuid,
    pub batch_code: String,
    pub farmer_id: String,
    pub crop_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    #[serde(alias = "certificateId")]
    pub certificate_id: String,
    #[serde(alias = "qrPayload")]
    pub qr_payload: String,
}

#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue_certificate(&self, request: &CertificateRequest) -> Result<IssuedCertificate, IssuerError>;
}

/// HTTP client for a remote (blockchain-backed) issuer: `POST {base_url}/certificates`
pub struct HttpCertificateIssuer {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpCertificateIssuer {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, IssuerError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| IssuerError::NetworkError(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CertificateIssuer for HttpCertificateIssuer {
    async fn issue_certificate(&self, request: &CertificateRequest) -> Result<IssuedCertificate, IssuerError> {
        let response = self
            .http_client
            .post(format!("{}/certificates", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| IssuerError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(IssuerError::ApiError(status.as_u16(), error_text));
        }

        let issued: IssuedCertificate = response
            .json()
            .await
            .map_err(|e| IssuerError::ParseError(e.to_string()))?;

        tracing::info!(
            batch_id = %request.batch_id,
            certificate_id = %issued.certificate_id,
            "Issuer minted certificate"
        );

        Ok(issued)
    }
}

/// Offline issuer deriving the certificate id from a SHA-256 of the batch identity
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCertificateIssuer;

#[async_trait]
impl CertificateIssuer for LocalCertificateIssuer {
    async fn issue_certificate(&self, request: &CertificateRequest) -> Result<IssuedCertificate, IssuerError> {
        let digest = Sha256::digest(format!("{}:{}", request.batch_id, request.batch_code).as_bytes());
        let hex = format!("{:x}", digest);
        let certificate_id = format!("CERT-{}", hex[..16].to_ascii_uppercase());

        let qr_payload = serde_json::json!({
            "certificate_id": certificate_id,
            "batch_code": request.batch_code,
            "crop": request.crop_name,
            "digest": hex,
        })
        .to_string();

        Ok(IssuedCertificate {
            certificate_id,
            qr_payload,
        })
    }
}
