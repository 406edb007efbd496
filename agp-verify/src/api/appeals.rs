//! Appeal endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::parse_stage;
use crate::error::ApiResult;
use crate::models::{Actor, Appeal, AppealResolution, RecordKey};
use crate::services::ResolvedAppeal;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct FileAppealRequest {
    pub batch_id: Uuid,
    pub stage: String,
    pub image_url: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ListAppealsQuery {
    pub batch_id: Option<Uuid>,
    /// Only OPEN appeals
    #[serde(default)]
    pub open: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResolveAppealRequest {
    pub resolution: AppealResolution,
    #[serde(default)]
    pub note: Option<String>,
}

/// POST /appeals
pub async fn file_appeal(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<FileAppealRequest>,
) -> ApiResult<(StatusCode, Json<Appeal>)> {
    let key = RecordKey::new(request.batch_id, parse_stage(&request.stage)?, request.image_url);
    let appeal = state
        .workflow
        .appeals
        .file_appeal(&actor, &key, &request.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(appeal)))
}

/// GET /appeals?batch_id=&open=
pub async fn list_appeals(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<ListAppealsQuery>,
) -> ApiResult<Json<Vec<Appeal>>> {
    Ok(Json(
        state
            .workflow
            .appeals
            .list_appeals(&actor, query.batch_id, query.open)
            .await?,
    ))
}

/// POST /appeals/:appeal_id/resolve
pub async fn resolve_appeal(
    State(state): State<AppState>,
    actor: Actor,
    Path(appeal_id): Path<Uuid>,
    Json(request): Json<ResolveAppealRequest>,
) -> ApiResult<Json<ResolvedAppeal>> {
    Ok(Json(
        state
            .workflow
            .appeals
            .resolve_appeal(&actor, appeal_id, request.resolution, request.note.as_deref())
            .await?,
    ))
}
