//! HTTP API handlers for agp-verify
//!
//! Authentication happens upstream. Every request names its acting user in
//! the `X-Actor-Role` (`farmer` / `admin`) and `X-Actor-Id` headers.

pub mod appeals;
pub mod batches;
pub mod health;
pub mod settings;
pub mod sse;
pub mod stages;
pub mod verifications;

pub use appeals::{file_appeal, list_appeals, resolve_appeal};
pub use batches::{
    create_batch, get_batch, get_batch_by_code, get_progress, list_batches, reject_batch, request_certificate,
    verify_batch,
};
pub use health::health_routes;
pub use settings::{get_triage_settings, reset_triage_settings, update_triage_settings};
pub use sse::event_stream;
pub use stages::{list_stages, rescore_batch, submit_stage};
pub use verifications::{decide, flag, reset, review_queue};

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::error::ApiError;
use crate::models::{Actor, StageName};

pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";
pub const ACTOR_ID_HEADER: &str = "x-actor-id";

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let role = header_value(parts, ACTOR_ROLE_HEADER)?;
        let id = header_value(parts, ACTOR_ID_HEADER)?;
        Ok(Actor::from_role(role, id)?)
    }
}

fn header_value<'a>(parts: &'a Parts, name: &str) -> Result<&'a str, ApiError> {
    parts
        .headers
        .get(name)
        .ok_or_else(|| ApiError::BadRequest(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| ApiError::BadRequest(format!("{} header is not valid text", name)))
}

/// Stage name from a path segment; accepts `SOWING`, `sowing` or `Land Preparation`
pub(crate) fn parse_stage(value: &str) -> Result<StageName, ApiError> {
    value.parse::<StageName>().map_err(ApiError::BadRequest)
}
