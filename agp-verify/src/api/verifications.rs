//! Admin moderation endpoints

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::parse_stage;
use crate::error::ApiResult;
use crate::models::{Actor, RecordKey, VerificationRecord, VerificationStatus};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct QueueQuery {
    pub batch_id: Option<Uuid>,
    pub limit: Option<i64>,
}

/// Identifies one record plus the version the client last saw
#[derive(Debug, Deserialize)]
pub struct RecordRef {
    pub batch_id: Uuid,
    pub stage: String,
    pub image_url: String,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

impl RecordRef {
    fn key(&self) -> ApiResult<RecordKey> {
        Ok(RecordKey::new(self.batch_id, parse_stage(&self.stage)?, self.image_url.clone()))
    }
}

#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    #[serde(flatten)]
    pub record: RecordRef,
    pub status: VerificationStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FlagRequest {
    #[serde(flatten)]
    pub record: RecordRef,
    #[serde(default)]
    pub note: Option<String>,
}

/// GET /verifications/queue?batch_id=&limit=
pub async fn review_queue(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<QueueQuery>,
) -> ApiResult<Json<Vec<VerificationRecord>>> {
    Ok(Json(
        state
            .workflow
            .moderation
            .review_queue(&actor, query.batch_id, query.limit)
            .await?,
    ))
}

/// POST /verifications/decide
pub async fn decide(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<DecideRequest>,
) -> ApiResult<Json<VerificationRecord>> {
    let key = request.record.key()?;
    let record = state
        .workflow
        .moderation
        .decide(
            &actor,
            &key,
            request.status,
            request.reason.as_deref(),
            request.record.expected_version,
        )
        .await?;
    Ok(Json(record))
}

/// POST /verifications/flag
pub async fn flag(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<FlagRequest>,
) -> ApiResult<Json<VerificationRecord>> {
    let key = request.record.key()?;
    let record = state
        .workflow
        .moderation
        .flag(&actor, &key, request.note.as_deref(), request.record.expected_version)
        .await?;
    Ok(Json(record))
}

/// POST /verifications/reset
pub async fn reset(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<RecordRef>,
) -> ApiResult<Json<VerificationRecord>> {
    let key = request.key()?;
    let record = state
        .workflow
        .moderation
        .reset(&actor, &key, request.expected_version)
        .await?;
    Ok(Json(record))
}
