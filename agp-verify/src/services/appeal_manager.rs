//! Appeals against FAKE decisions
//!
//! Filing checks the record is FAKE in the same statement that inserts the
//! appeal. Resolution closes the appeal and applies its effect on the record
//! in one transaction; nothing resolves an appeal automatically.

use agp_common::db::retry_on_lock;
use agp_common::events::{AgpEvent, EventBus};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::certificate_gate::CertificateGate;
use super::notifier::ReviewerNotifier;
use super::{ensure_can_view, ensure_owner, load_batch};
use crate::db::verifications::{self, RecordUpdate, RecordWrite};
use crate::db::{appeals, settings};
use crate::error::{ConflictKind, WorkflowError, WorkflowResult};
use crate::models::{
    Actor, Appeal, AppealResolution, AppealStatus, RecordKey, VerificationRecord, VerificationStatus,
};

/// A resolved appeal and the record it changed, if any
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedAppeal {
    pub appeal: Appeal,
    /// None when the rejection was upheld
    pub record: Option<VerificationRecord>,
}

enum ResolveStep {
    Missing,
    AlreadyResolved,
    /// Upholding would contradict the record's current decision; rolled back
    RecordChanged(String),
    Resolved(Appeal, Option<VerificationRecord>),
}

#[derive(Clone)]
pub struct AppealManager {
    db: SqlitePool,
    event_bus: EventBus,
    notifier: Arc<dyn ReviewerNotifier>,
    gate: CertificateGate,
}

impl AppealManager {
    pub fn new(db: SqlitePool, event_bus: EventBus, notifier: Arc<dyn ReviewerNotifier>, gate: CertificateGate) -> Self {
        Self {
            db,
            event_bus,
            notifier,
            gate,
        }
    }

    /// Dispute a FAKE decision on one of the farmer's own images
    pub async fn file_appeal(&self, actor: &Actor, key: &RecordKey, reason: &str) -> WorkflowResult<Appeal> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(WorkflowError::Validation("An appeal reason is required".to_string()));
        }

        let batch = load_batch(&self.db, key.batch_id).await?;
        let farmer_id = ensure_owner(actor, &batch)?;

        let now = Utc::now();
        let appeal = Appeal {
            appeal_id: Uuid::new_v4(),
            batch_id: key.batch_id,
            stage: key.stage,
            image_url: key.image_url.clone(),
            farmer_id,
            reason: reason.to_string(),
            status: AppealStatus::Open,
            resolution: None,
            resolved_by: None,
            resolution_note: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        };

        if !appeals::insert_if_fake(&self.db, &appeal).await? {
            let record = verifications::get_record(&self.db, key).await?.ok_or_else(|| {
                WorkflowError::NotFound(format!(
                    "Verification record for {} in stage {}",
                    key.image_url, key.stage
                ))
            })?;

            return Err(match record.verification_status() {
                Some(VerificationStatus::Fake) => WorkflowError::conflict(ConflictKind::AppealAlreadyOpen),
                Some(status) => WorkflowError::conflict(ConflictKind::InvalidAppealState {
                    current: status.as_str().to_string(),
                }),
                None => WorkflowError::conflict(ConflictKind::InvalidAppealState {
                    current: "PENDING".to_string(),
                }),
            });
        }

        info!(
            appeal_id = %appeal.appeal_id,
            batch_id = %appeal.batch_id,
            stage = %appeal.stage,
            image_url = %appeal.image_url,
            farmer_id = %appeal.farmer_id,
            "Appeal filed"
        );
        self.notifier.appeal_filed(&appeal).await;

        Ok(appeal)
    }

    /// Close an open appeal and apply the resolution to its record
    pub async fn resolve_appeal(
        &self,
        actor: &Actor,
        appeal_id: Uuid,
        resolution: AppealResolution,
        note: Option<&str>,
    ) -> WorkflowResult<ResolvedAppeal> {
        let admin_id = actor.require_admin()?;
        let note = note.map(str::trim).filter(|n| !n.is_empty());
        let max_wait_ms = settings::get_max_lock_wait_ms(&self.db).await?;
        let db = &self.db;
        let now = Utc::now();

        let step = retry_on_lock("resolve_appeal", max_wait_ms, || async move {
            let mut tx = db.begin().await?;

            // Write first so the transaction holds the write lock before any read
            if !appeals::mark_resolved(&mut tx, appeal_id, resolution, admin_id, note, now).await? {
                return Ok(match appeals::get_appeal(&mut tx, appeal_id).await? {
                    None => ResolveStep::Missing,
                    Some(_) => ResolveStep::AlreadyResolved,
                });
            }

            let appeal = appeals::get_appeal(&mut tx, appeal_id)
                .await?
                .ok_or_else(|| agp_common::Error::Internal(format!("Appeal {} vanished while resolving", appeal_id)))?;
            let key = RecordKey::new(appeal.batch_id, appeal.stage, appeal.image_url.clone());

            let update = match resolution {
                AppealResolution::ResetToPending => Some(RecordUpdate::Reset),
                AppealResolution::ApprovedAsReal => Some(RecordUpdate::Decide {
                    status: VerificationStatus::Real,
                    reason: None,
                    by: admin_id.to_string(),
                }),
                AppealResolution::RejectionUpheld => {
                    // Moderation may have re-decided the image since filing
                    let current = verifications::get_record(&mut *tx, &key)
                        .await?
                        .and_then(|r| r.verification_status());
                    if current != Some(VerificationStatus::Fake) {
                        // Dropping the transaction rolls back mark_resolved
                        return Ok(ResolveStep::RecordChanged(
                            current.map_or("PENDING", |s| s.as_str()).to_string(),
                        ));
                    }
                    None
                }
            };

            let record = match update {
                Some(update) => match verifications::update_record(&mut tx, &key, &update, None, now).await? {
                    RecordWrite::Written(record) => Some(record),
                    RecordWrite::Missing | RecordWrite::Stale { .. } => {
                        return Err(agp_common::Error::Internal(format!(
                            "Appealed record {} in stage {} could not be updated",
                            key.image_url, key.stage
                        )))
                    }
                },
                None => None,
            };

            tx.commit().await?;
            Ok(ResolveStep::Resolved(appeal, record))
        })
        .await?;

        let (appeal, record) = match step {
            ResolveStep::Missing => return Err(WorkflowError::NotFound(format!("Appeal {}", appeal_id))),
            ResolveStep::AlreadyResolved => return Err(WorkflowError::conflict(ConflictKind::AppealAlreadyResolved)),
            ResolveStep::RecordChanged(current) => {
                return Err(WorkflowError::conflict(ConflictKind::AppealRecordChanged { current }))
            }
            ResolveStep::Resolved(appeal, record) => (appeal, record),
        };

        info!(
            appeal_id = %appeal_id,
            batch_id = %appeal.batch_id,
            resolution = resolution.as_str(),
            actor = admin_id,
            "Appeal resolved"
        );
        self.event_bus.emit_lossy(AgpEvent::AppealResolved {
            appeal_id,
            batch_id: appeal.batch_id,
            resolution: resolution.as_str().to_string(),
            actor_id: admin_id.to_string(),
            timestamp: now,
        });

        if let Some(record) = &record {
            self.event_bus.emit_lossy(AgpEvent::VerificationUpdated {
                batch_id: record.key.batch_id,
                stage: record.key.stage.to_string(),
                image_url: record.key.image_url.clone(),
                status: record.verification_status().map(|s| s.as_str().to_string()),
                version: record.version,
                actor_id: admin_id.to_string(),
                timestamp: now,
            });
            self.gate.evaluate_after_change(appeal.batch_id).await;
        }

        Ok(ResolvedAppeal { appeal, record })
    }

    /// Admins see every appeal; farmers only appeals on their own batches
    pub async fn list_appeals(
        &self,
        actor: &Actor,
        batch_id: Option<Uuid>,
        open_only: bool,
    ) -> WorkflowResult<Vec<Appeal>> {
        if let Some(batch_id) = batch_id {
            let batch = load_batch(&self.db, batch_id).await?;
            ensure_can_view(actor, &batch)?;
        }

        let mut listed = appeals::list_appeals(&self.db, batch_id, open_only).await?;
        if let Actor::Farmer(farmer_id) = actor {
            listed.retain(|a| &a.farmer_id == farmer_id);
        }
        Ok(listed)
    }
}
