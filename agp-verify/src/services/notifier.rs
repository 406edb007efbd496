//! Reviewer notification
//!
//! Notification is fire-and-forget: a failure to notify never fails the
//! appeal that triggered it.

use agp_common::events::{AgpEvent, EventBus};
use async_trait::async_trait;

use crate::models::Appeal;

#[async_trait]
pub trait ReviewerNotifier: Send + Sync {
    async fn appeal_filed(&self, appeal: &Appeal);
}

/// Publishes appeals on the event bus, where the SSE stream delivers them to reviewers
pub struct EventBusNotifier {
    event_bus: EventBus,
}

impl EventBusNotifier {
    pub fn new(event_bus: EventBus) -> Self {
        Self { event_bus }
    }
}

#[async_trait]
impl ReviewerNotifier for EventBusNotifier {
    async fn appeal_filed(&self, appeal: &Appeal) {
        let delivered = self
            .event_bus
            .emit(AgpEvent::AppealFiled {
                appeal_id: appeal.appeal_id,
                batch_id: appeal.batch_id,
                stage: appeal.stage.to_string(),
                image_url: appeal.image_url.clone(),
                farmer_id: appeal.farmer_id.clone(),
                reason: appeal.reason.clone(),
                timestamp: appeal.created_at,
            })
            .is_ok();

        tracing::info!(
            appeal_id = %appeal.appeal_id,
            batch_id = %appeal.batch_id,
            stage = %appeal.stage,
            delivered,
            "Reviewers notified of appeal"
        );
    }
}
