//! agp-verify library - Batch/Stage Verification & Moderation
//!
//! Farmers document crop batches through seven cultivation stages with
//! photographic evidence. Every image is scored by an AI service, triaged,
//! and moderated by admins; a batch is certified once it is VERIFIED and all
//! stages are complete.

use agp_common::config::LimitsConfig;
use agp_common::events::EventBus;
use axum::extract::DefaultBodyLimit;
use axum::Router;
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

use services::Workflow;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub workflow: Workflow,
    /// Request body cap applied by the router
    pub max_request_bytes: usize,
}

impl AppState {
    pub fn new(db: SqlitePool, event_bus: EventBus, workflow: Workflow) -> Self {
        Self {
            db,
            event_bus,
            workflow,
            max_request_bytes: LimitsConfig::default().max_request_bytes,
        }
    }

    pub fn with_max_request_bytes(mut self, max_request_bytes: usize) -> Self {
        self.max_request_bytes = max_request_bytes;
        self
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::{get, post};

    let body_limit = state.max_request_bytes;

    let batches = Router::new()
        .route("/batches", post(api::create_batch).get(api::list_batches))
        .route("/batches/by-code/:batch_code", get(api::get_batch_by_code))
        .route("/batches/:batch_id", get(api::get_batch))
        .route("/batches/:batch_id/progress", get(api::get_progress))
        .route("/batches/:batch_id/verify", post(api::verify_batch))
        .route("/batches/:batch_id/reject", post(api::reject_batch))
        .route("/batches/:batch_id/certificate", post(api::request_certificate))
        .route("/batches/:batch_id/stages", get(api::list_stages))
        .route("/batches/:batch_id/stages/:stage", post(api::submit_stage))
        .route("/batches/:batch_id/rescore", post(api::rescore_batch));

    let moderation = Router::new()
        .route("/verifications/queue", get(api::review_queue))
        .route("/verifications/decide", post(api::decide))
        .route("/verifications/flag", post(api::flag))
        .route("/verifications/reset", post(api::reset))
        .route("/appeals", post(api::file_appeal).get(api::list_appeals))
        .route("/appeals/:appeal_id/resolve", post(api::resolve_appeal))
        .route(
            "/settings/triage",
            get(api::get_triage_settings)
                .put(api::update_triage_settings)
                .delete(api::reset_triage_settings),
        );

    Router::new()
        .merge(batches)
        .merge(moderation)
        .route("/events", get(api::event_stream))
        .merge(api::health_routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
