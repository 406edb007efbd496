//! Admin moderation of verification records
//!
//! Every write is versioned. A caller that sends the version it last saw gets
//! `StaleVersion` instead of overwriting a newer decision; callers that omit
//! it resolve last-write-wins.

use agp_common::events::{AgpEvent, EventBus};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use super::certificate_gate::CertificateGate;
use crate::db::verifications::{self, RecordUpdate, RecordWrite};
use crate::error::{ConflictKind, WorkflowError, WorkflowResult};
use crate::models::{Actor, RecordKey, VerificationRecord, VerificationStatus};

pub const DEFAULT_QUEUE_LIMIT: i64 = 100;
pub const MAX_QUEUE_LIMIT: i64 = 1000;

#[derive(Clone)]
pub struct Moderation {
    db: SqlitePool,
    event_bus: EventBus,
    gate: CertificateGate,
}

impl Moderation {
    pub fn new(db: SqlitePool, event_bus: EventBus, gate: CertificateGate) -> Self {
        Self { db, event_bus, gate }
    }

    /// Set REAL or FAKE; FAKE needs a non-empty reason
    pub async fn decide(
        &self,
        actor: &Actor,
        key: &RecordKey,
        status: VerificationStatus,
        reason: Option<&str>,
        expected_version: Option<i64>,
    ) -> WorkflowResult<VerificationRecord> {
        let admin_id = actor.require_admin()?;
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());

        if status == VerificationStatus::Fake && reason.is_none() {
            return Err(WorkflowError::Validation(
                "A rejection reason is required when marking an image FAKE".to_string(),
            ));
        }

        let update = RecordUpdate::Decide {
            status,
            reason: reason.map(str::to_string),
            by: admin_id.to_string(),
        };
        self.write(admin_id, key, &update, expected_version).await
    }

    /// Send a record back to the review queue with a note
    pub async fn flag(
        &self,
        actor: &Actor,
        key: &RecordKey,
        note: Option<&str>,
        expected_version: Option<i64>,
    ) -> WorkflowResult<VerificationRecord> {
        let admin_id = actor.require_admin()?;
        let note = note.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string);
        self.write(admin_id, key, &RecordUpdate::Flag { note }, expected_version)
            .await
    }

    /// Clear status and reason; the AI payload stays
    pub async fn reset(
        &self,
        actor: &Actor,
        key: &RecordKey,
        expected_version: Option<i64>,
    ) -> WorkflowResult<VerificationRecord> {
        let admin_id = actor.require_admin()?;
        self.write(admin_id, key, &RecordUpdate::Reset, expected_version).await
    }

    /// Pending records, AUTO_REJECT first
    pub async fn review_queue(
        &self,
        actor: &Actor,
        batch_id: Option<Uuid>,
        limit: Option<i64>,
    ) -> WorkflowResult<Vec<VerificationRecord>> {
        actor.require_admin()?;
        let limit = limit.unwrap_or(DEFAULT_QUEUE_LIMIT).clamp(1, MAX_QUEUE_LIMIT);
        Ok(verifications::review_queue(&self.db, batch_id, limit).await?)
    }

    async fn write(
        &self,
        admin_id: &str,
        key: &RecordKey,
        update: &RecordUpdate,
        expected_version: Option<i64>,
    ) -> WorkflowResult<VerificationRecord> {
        let now = Utc::now();
        let mut conn = self.db.acquire().await?;
        let outcome = verifications::update_record(&mut conn, key, update, expected_version, now).await?;
        drop(conn);

        let record = match outcome {
            RecordWrite::Written(record) => record,
            RecordWrite::Missing => {
                return Err(WorkflowError::NotFound(format!(
                    "Verification record for {} in stage {} of batch {}",
                    key.image_url, key.stage, key.batch_id
                )))
            }
            RecordWrite::Stale { actual } => {
                return Err(WorkflowError::conflict(ConflictKind::StaleVersion {
                    expected: expected_version.unwrap_or_default(),
                    actual,
                }))
            }
        };

        let status = record.verification_status().map(|s| s.as_str().to_string());
        info!(
            batch_id = %key.batch_id,
            stage = %key.stage,
            image_url = %key.image_url,
            status = status.as_deref().unwrap_or("PENDING"),
            version = record.version,
            actor = admin_id,
            "Verification record updated"
        );
        self.event_bus.emit_lossy(AgpEvent::VerificationUpdated {
            batch_id: key.batch_id,
            stage: key.stage.to_string(),
            image_url: key.image_url.clone(),
            status,
            version: record.version,
            actor_id: admin_id.to_string(),
            timestamp: now,
        });

        self.gate.evaluate_after_change(key.batch_id).await;
        Ok(record)
    }
}
