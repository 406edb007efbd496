//! Batch endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{Actor, Batch, BatchDetails, BatchProgress, BatchStatus};
use crate::services::{BatchTransition, CertificateResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListBatchesQuery {
    pub farmer_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

/// POST /batches
pub async fn create_batch(
    State(state): State<AppState>,
    actor: Actor,
    Json(details): Json<BatchDetails>,
) -> ApiResult<(StatusCode, Json<Batch>)> {
    let batch = state.workflow.batches.create_batch(&actor, details).await?;
    Ok((StatusCode::CREATED, Json(batch)))
}

/// GET /batches/:batch_id
pub async fn get_batch(
    State(state): State<AppState>,
    actor: Actor,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<Batch>> {
    Ok(Json(state.workflow.batches.get_batch(&actor, batch_id).await?))
}

/// GET /batches/by-code/:batch_code
pub async fn get_batch_by_code(
    State(state): State<AppState>,
    actor: Actor,
    Path(batch_code): Path<String>,
) -> ApiResult<Json<Batch>> {
    Ok(Json(
        state.workflow.batches.get_batch_by_code(&actor, &batch_code).await?,
    ))
}

/// GET /batches?farmer_id=&status=
pub async fn list_batches(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<ListBatchesQuery>,
) -> ApiResult<Json<Vec<Batch>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<BatchStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let batches = state
        .workflow
        .batches
        .list_batches(&actor, query.farmer_id.as_deref(), status)
        .await?;
    Ok(Json(batches))
}

/// GET /batches/:batch_id/progress
pub async fn get_progress(
    State(state): State<AppState>,
    actor: Actor,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<BatchProgress>> {
    Ok(Json(state.workflow.batches.progress(&actor, batch_id).await?))
}

/// POST /batches/:batch_id/verify
pub async fn verify_batch(
    State(state): State<AppState>,
    actor: Actor,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<BatchTransition>> {
    Ok(Json(state.workflow.batches.verify_batch(&actor, batch_id).await?))
}

/// POST /batches/:batch_id/reject
pub async fn reject_batch(
    State(state): State<AppState>,
    actor: Actor,
    Path(batch_id): Path<Uuid>,
    Json(request): Json<RejectRequest>,
) -> ApiResult<Json<BatchTransition>> {
    Ok(Json(
        state
            .workflow
            .batches
            .reject_batch(&actor, batch_id, &request.reason)
            .await?,
    ))
}

/// POST /batches/:batch_id/certificate
///
/// Re-runs the certificate gate, e.g. after an issuer outage.
pub async fn request_certificate(
    State(state): State<AppState>,
    actor: Actor,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<CertificateResult>> {
    Ok(Json(
        state.workflow.certificates.issue_on_request(&actor, batch_id).await?,
    ))
}
