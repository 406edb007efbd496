//! Triage threshold settings
//!
//! Stored overrides take precedence over the `[triage]` section of the TOML
//! config and apply to submissions started after the update.

use axum::{extract::State, Json};

use crate::error::ApiResult;
use crate::models::Actor;
use crate::services::TriageThresholds;
use crate::AppState;

/// GET /settings/triage
pub async fn get_triage_settings(State(state): State<AppState>, actor: Actor) -> ApiResult<Json<TriageThresholds>> {
    actor.require_admin()?;
    Ok(Json(state.workflow.triage_thresholds().await))
}

/// PUT /settings/triage
pub async fn update_triage_settings(
    State(state): State<AppState>,
    actor: Actor,
    Json(thresholds): Json<TriageThresholds>,
) -> ApiResult<Json<TriageThresholds>> {
    Ok(Json(
        state.workflow.update_triage_thresholds(&actor, thresholds).await?,
    ))
}

/// DELETE /settings/triage
pub async fn reset_triage_settings(State(state): State<AppState>, actor: Actor) -> ApiResult<Json<TriageThresholds>> {
    Ok(Json(state.workflow.reset_triage_thresholds(&actor).await?))
}
