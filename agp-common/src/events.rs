//! Event types for the AgriProv event system
//!
//! Provides shared event definitions and the EventBus used to fan workflow
//! notifications out to SSE clients and reviewer notifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// AgriProv event types
///
/// Broadcast via EventBus and serialized for SSE transmission.
/// Stage names and statuses travel as their wire strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgpEvent {
    /// A stage submission finished uploading and scoring
    StageSubmitted {
        batch_id: Uuid,
        stage: String,
        image_count: usize,
        /// Images still awaiting a human decision after triage
        pending_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// Triage produced a verification record for a newly scored image
    ImageTriaged {
        batch_id: Uuid,
        stage: String,
        image_url: String,
        /// AUTO_APPROVE / AUTO_REJECT / FLAG_FOR_HUMAN
        ai_action: String,
        /// False when the AI service was unavailable
        scored: bool,
        timestamp: DateTime<Utc>,
    },

    /// An admin changed a verification record (decide / flag / reset / appeal resolution)
    VerificationUpdated {
        batch_id: Uuid,
        stage: String,
        image_url: String,
        /// REAL / FAKE, or None when returned to pending
        status: Option<String>,
        version: i64,
        actor_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Coarse batch status changed
    BatchStatusChanged {
        batch_id: Uuid,
        old_status: String,
        new_status: String,
        actor_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A farmer disputed a FAKE decision
    AppealFiled {
        appeal_id: Uuid,
        batch_id: Uuid,
        stage: String,
        image_url: String,
        farmer_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// An admin resolved an appeal
    AppealResolved {
        appeal_id: Uuid,
        batch_id: Uuid,
        resolution: String,
        actor_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Certificate issued for a batch
    CertificateIssued {
        batch_id: Uuid,
        certificate_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Certificate revoked because its batch left VERIFIED
    CertificateRevoked {
        batch_id: Uuid,
        certificate_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Revoked certificate reinstated after the batch was re-verified
    CertificateReinstated {
        batch_id: Uuid,
        certificate_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl AgpEvent {
    /// Event type name (used as the SSE `event:` field)
    pub fn event_type(&self) -> &'static str {
        match self {
            AgpEvent::StageSubmitted { .. } => "StageSubmitted",
            AgpEvent::ImageTriaged { .. } => "ImageTriaged",
            AgpEvent::VerificationUpdated { .. } => "VerificationUpdated",
            AgpEvent::BatchStatusChanged { .. } => "BatchStatusChanged",
            AgpEvent::AppealFiled { .. } => "AppealFiled",
            AgpEvent::AppealResolved { .. } => "AppealResolved",
            AgpEvent::CertificateIssued { .. } => "CertificateIssued",
            AgpEvent::CertificateRevoked { .. } => "CertificateRevoked",
            AgpEvent::CertificateReinstated { .. } => "CertificateReinstated",
        }
    }

    /// Batch the event belongs to
    pub fn batch_id(&self) -> Uuid {
        match self {
            AgpEvent::StageSubmitted { batch_id, .. }
            | AgpEvent::ImageTriaged { batch_id, .. }
            | AgpEvent::VerificationUpdated { batch_id, .. }
            | AgpEvent::BatchStatusChanged { batch_id, .. }
            | AgpEvent::AppealFiled { batch_id, .. }
            | AgpEvent::AppealResolved { batch_id, .. }
            | AgpEvent::CertificateIssued { batch_id, .. }
            | AgpEvent::CertificateRevoked { batch_id, .. }
            | AgpEvent::CertificateReinstated { batch_id, .. } => *batch_id,
        }
    }
}

/// Broadcast bus for AgpEvents
///
/// Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgpEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus; `capacity` events are buffered before lagging
    /// receivers start losing the oldest ones.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<AgpEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: AgpEvent) -> Result<usize, broadcast::error::SendError<AgpEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: AgpEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        let batch_id = Uuid::new_v4();

        bus.emit(AgpEvent::CertificateIssued {
            batch_id,
            certificate_id: "cert-1".to_string(),
            timestamp: Utc::now(),
        })
        .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "CertificateIssued");
        assert_eq!(event.batch_id(), batch_id);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(10);
        let event = AgpEvent::BatchStatusChanged {
            batch_id: Uuid::new_v4(),
            old_status: "PENDING".to_string(),
            new_status: "VERIFIED".to_string(),
            actor_id: "admin-1".to_string(),
            timestamp: Utc::now(),
        };

        assert!(bus.emit(event.clone()).is_err());
        bus.emit_lossy(event);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_serialized_with_type_tag() {
        let event = AgpEvent::AppealFiled {
            appeal_id: Uuid::nil(),
            batch_id: Uuid::nil(),
            stage: "SOWING".to_string(),
            image_url: "https://img/1.jpg".to_string(),
            farmer_id: "farmer-7".to_string(),
            reason: "taken on my farm".to_string(),
            timestamp: Utc::now(),
        };

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "AppealFiled");
        assert_eq!(json["stage"], "SOWING");
    }
}
