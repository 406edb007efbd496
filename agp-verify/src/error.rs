//! Error types for agp-verify
//!
//! `WorkflowError` is the service-level taxonomy: validation and state
//! conflicts are resolved at the component boundary, upload and issuer
//! failures are surfaced, AI failures never appear here (they degrade into a
//! FLAG_FOR_HUMAN triage outcome), and persistence failures are the only hard
//! failure. `ApiError` maps both onto HTTP responses.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Workflow error taxonomy
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Rejected before any external call; nothing was written
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Actor role or ownership does not permit the action
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Request conflicts with the current state of a record
    #[error("State conflict: {0}")]
    StateConflict(ConflictKind),

    /// Some or all images of a submission could not be stored
    #[error("Image upload failed: {0}")]
    UploadFailed(UploadFailure),

    /// Certificate issuer failed; batch status is left untouched
    #[error("Certificate issuer error: {0}")]
    Issuer(String),

    /// Storage layer failure
    #[error("Persistence error: {0}")]
    Persistence(#[from] agp_common::Error),
}

impl From<sqlx::Error> for WorkflowError {
    fn from(err: sqlx::Error) -> Self {
        WorkflowError::Persistence(agp_common::Error::Database(err))
    }
}

impl WorkflowError {
    pub fn conflict(kind: ConflictKind) -> Self {
        WorkflowError::StateConflict(kind)
    }
}

/// Specific reason for a state conflict, reported to the caller verbatim
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    /// Only FAKE decisions can be appealed
    #[error("InvalidAppealState: image status is {current}, only FAKE decisions can be appealed")]
    InvalidAppealState { current: String },

    #[error("An appeal is already open for this image")]
    AppealAlreadyOpen,

    #[error("Appeal has already been resolved")]
    AppealAlreadyResolved,

    /// The appealed record left FAKE after the appeal was filed
    #[error("Appealed image is now {current}, the rejection can no longer be upheld")]
    AppealRecordChanged { current: String },

    /// Caller acted on a superseded version of the record
    #[error("Record was modified: expected version {expected}, current version {actual}")]
    StaleVersion { expected: i64, actual: i64 },

    #[error("A certificate has already been issued for this batch")]
    CertificateAlreadyIssued,

    #[error("Certificate issuance is already in progress for this batch")]
    CertificateIssuanceInProgress,

    #[error("Batch cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

impl ConflictKind {
    /// Machine-readable code for API clients
    pub fn code(&self) -> &'static str {
        match self {
            ConflictKind::InvalidAppealState { .. } => "INVALID_APPEAL_STATE",
            ConflictKind::AppealAlreadyOpen => "APPEAL_ALREADY_OPEN",
            ConflictKind::AppealAlreadyResolved => "APPEAL_ALREADY_RESOLVED",
            ConflictKind::AppealRecordChanged { .. } => "APPEAL_RECORD_CHANGED",
            ConflictKind::StaleVersion { .. } => "STALE_VERSION",
            ConflictKind::CertificateAlreadyIssued => "CERTIFICATE_ALREADY_ISSUED",
            ConflictKind::CertificateIssuanceInProgress => "CERTIFICATE_ISSUANCE_IN_PROGRESS",
            ConflictKind::InvalidTransition { .. } => "INVALID_TRANSITION",
        }
    }
}

/// Which images of a submission were stored and which were not
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadFailure {
    pub stage: String,
    /// URLs stored during this submission, in submission order
    pub uploaded: Vec<String>,
    pub failed: Vec<FailedUpload>,
    /// Images on the persisted stage record after this submission
    pub persisted_image_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedUpload {
    /// Position in the submitted image list
    pub index: usize,
    pub file_name: String,
    pub error: String,
}

impl fmt::Display for UploadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} images for stage {} failed to upload ({} persisted on the stage)",
            self.failed.len(),
            self.failed.len() + self.uploaded.len(),
            self.stage,
            self.persisted_image_count
        )
    }
}

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Request body over the configured limit (413)
    #[error("Request body too large: {0}")]
    PayloadTooLarge(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// agp-common error
    #[error("Common error: {0}")]
    Common(#[from] agp_common::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg, None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg, None),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", msg, None),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg, None),
            ApiError::Common(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "PERSISTENCE_ERROR",
                err.to_string(),
                None,
            ),
            ApiError::Workflow(err) => match err {
                WorkflowError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg, None),
                WorkflowError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg, None),
                WorkflowError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg, None),
                WorkflowError::StateConflict(kind) => (
                    StatusCode::CONFLICT,
                    kind.code(),
                    kind.to_string(),
                    serde_json::to_value(&kind).ok(),
                ),
                WorkflowError::UploadFailed(failure) => (
                    StatusCode::BAD_GATEWAY,
                    "UPLOAD_FAILED",
                    failure.to_string(),
                    serde_json::to_value(&failure).ok(),
                ),
                WorkflowError::Issuer(msg) => (StatusCode::BAD_GATEWAY, "CERTIFICATE_ISSUER_ERROR", msg, None),
                WorkflowError::Persistence(err) => {
                    tracing::error!(error = %err, "Persistence failure surfaced to caller");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "PERSISTENCE_ERROR",
                        err.to_string(),
                        None,
                    )
                }
            },
        };

        let mut error = json!({
            "code": error_code,
            "message": message,
        });
        if let Some(details) = details {
            error["details"] = details;
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(rejection.body_text())
        } else {
            ApiError::BadRequest(rejection.body_text())
        }
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type for workflow services
pub type WorkflowResult<T> = Result<T, WorkflowError>;
