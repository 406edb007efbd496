//! Stage submission endpoints
//!
//! Images travel as base64 inside the JSON body.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use uuid::Uuid;

use super::parse_stage;
use crate::error::{ApiError, ApiResult};
use crate::models::{Actor, StageStatus};
use crate::services::{ImageUpload, RescoreReport, StageResult, StageSubmission, StageView};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ImagePayload {
    pub file_name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Base64 (standard alphabet)
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitStageRequest {
    pub images: Vec<ImagePayload>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub status: Option<StageStatus>,
}

/// POST /batches/:batch_id/stages/:stage
pub async fn submit_stage(
    State(state): State<AppState>,
    actor: Actor,
    Path((batch_id, stage)): Path<(Uuid, String)>,
    payload: Result<Json<SubmitStageRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<StageResult>)> {
    let Json(request) = payload?;
    let stage = parse_stage(&stage)?;

    let images = request
        .images
        .into_iter()
        .enumerate()
        .map(|(index, image)| -> ApiResult<ImageUpload> {
            let bytes = STANDARD.decode(image.data.trim()).map_err(|e| {
                ApiError::BadRequest(format!("Image {} ({}) is not valid base64: {}", index, image.file_name, e))
            })?;
            Ok(ImageUpload {
                file_name: image.file_name,
                content_type: image.content_type,
                bytes,
            })
        })
        .collect::<ApiResult<Vec<_>>>()?;

    let result = state
        .workflow
        .stages
        .submit_stage(
            &actor,
            StageSubmission {
                batch_id,
                stage,
                images,
                notes: request.notes,
                status: request.status,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(result)))
}

/// GET /batches/:batch_id/stages
pub async fn list_stages(
    State(state): State<AppState>,
    actor: Actor,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<Vec<StageView>>> {
    Ok(Json(
        state.workflow.stages.list_stage_views(&actor, batch_id).await?,
    ))
}

/// POST /batches/:batch_id/rescore
pub async fn rescore_batch(
    State(state): State<AppState>,
    actor: Actor,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<RescoreReport>> {
    Ok(Json(state.workflow.stages.rescore_batch(&actor, batch_id).await?))
}
