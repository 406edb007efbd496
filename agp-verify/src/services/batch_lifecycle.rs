//! Batch lifecycle
//!
//! PENDING -> VERIFIED | REJECTED, VERIFIED <-> REJECTED. Both transitions are
//! explicit admin actions. Leaving VERIFIED revokes an issued certificate and
//! re-entering it reinstates the same certificate; entering VERIFIED also
//! evaluates the certificate gate.

use agp_common::db::retry_on_lock;
use agp_common::events::{AgpEvent, EventBus};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use super::certificate_gate::{CertificateGate, CertificateResult};
use super::{ensure_can_view, load_batch};
use crate::db::{batches, certificates, settings, stages, verifications};
use crate::error::{WorkflowError, WorkflowResult};
use crate::models::{
    generate_batch_code, Actor, Batch, BatchDetails, BatchProgress, BatchStatus, StageName, StageProgress,
    MIN_STAGE_IMAGES,
};

/// Attempts at finding an unused batch code
const BATCH_CODE_ATTEMPTS: usize = 3;

/// Result of a verify / reject request
#[derive(Debug, Clone, Serialize)]
pub struct BatchTransition {
    pub batch: Batch,
    pub previous_status: BatchStatus,
    /// False when the batch was already in the requested status
    pub changed: bool,
    /// Gate outcome after entering VERIFIED
    pub certificate: Option<CertificateResult>,
    /// Issuer failure after entering VERIFIED; the status change still stands
    pub certificate_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum CertificateChange {
    Revoked(String),
    Reinstated(String),
}

#[derive(Debug, Clone, PartialEq)]
enum TransitionStep {
    Missing,
    Unchanged(BatchStatus),
    Moved {
        from: BatchStatus,
        certificate: Option<CertificateChange>,
    },
}

#[derive(Clone)]
pub struct BatchLifecycle {
    db: SqlitePool,
    event_bus: EventBus,
    gate: CertificateGate,
}

impl BatchLifecycle {
    pub fn new(db: SqlitePool, event_bus: EventBus, gate: CertificateGate) -> Self {
        Self { db, event_bus, gate }
    }

    /// Create a PENDING batch owned by the acting farmer
    pub async fn create_batch(&self, actor: &Actor, details: BatchDetails) -> WorkflowResult<Batch> {
        let farmer_id = actor.require_farmer()?.to_string();
        details.validate()?;

        let mut last_error = None;
        for _ in 0..BATCH_CODE_ATTEMPTS {
            let now = Utc::now();
            let batch_id = Uuid::new_v4();
            let batch = Batch {
                batch_id,
                batch_code: generate_batch_code(now, batch_id),
                farmer_id: farmer_id.clone(),
                details: details.clone(),
                status: BatchStatus::Pending,
                rejection_reason: None,
                verified_at: None,
                verified_by: None,
                certificate: None,
                created_at: now,
                updated_at: now,
            };

            match batches::insert_batch(&self.db, &batch).await {
                Ok(()) => {
                    info!(
                        batch_id = %batch.batch_id,
                        batch_code = %batch.batch_code,
                        farmer_id = %farmer_id,
                        crop = %batch.details.crop_name,
                        "Batch created"
                    );
                    return Ok(batch);
                }
                Err(e) if is_unique_violation(&e) => {
                    warn!(batch_code = %batch.batch_code, "Batch code collision, regenerating");
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_error
            .map(WorkflowError::from)
            .unwrap_or_else(|| WorkflowError::Validation("Could not allocate a batch code".to_string())))
    }

    pub async fn get_batch(&self, actor: &Actor, batch_id: Uuid) -> WorkflowResult<Batch> {
        let batch = load_batch(&self.db, batch_id).await?;
        ensure_can_view(actor, &batch)?;
        Ok(batch)
    }

    pub async fn get_batch_by_code(&self, actor: &Actor, batch_code: &str) -> WorkflowResult<Batch> {
        let batch = batches::get_batch_by_code(&self.db, batch_code)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Batch {}", batch_code)))?;
        ensure_can_view(actor, &batch)?;
        Ok(batch)
    }

    /// List batches; farmers only ever see their own
    pub async fn list_batches(
        &self,
        actor: &Actor,
        farmer_id: Option<&str>,
        status: Option<BatchStatus>,
    ) -> WorkflowResult<Vec<Batch>> {
        let farmer_filter = match actor {
            Actor::Admin(_) => farmer_id,
            Actor::Farmer(own) => {
                if let Some(requested) = farmer_id {
                    if requested != own {
                        return Err(WorkflowError::Forbidden(format!(
                            "Farmer {} cannot list batches of farmer {}",
                            own, requested
                        )));
                    }
                }
                Some(own.as_str())
            }
        };

        Ok(batches::list_batches(&self.db, farmer_filter, status).await?)
    }

    /// Admin approval; evaluates the certificate gate
    pub async fn verify_batch(&self, actor: &Actor, batch_id: Uuid) -> WorkflowResult<BatchTransition> {
        self.transition(actor, batch_id, BatchStatus::Verified, None).await
    }

    /// Admin rejection with a mandatory reason
    pub async fn reject_batch(&self, actor: &Actor, batch_id: Uuid, reason: &str) -> WorkflowResult<BatchTransition> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(WorkflowError::Validation("A rejection reason is required".to_string()));
        }
        self.transition(actor, batch_id, BatchStatus::Rejected, Some(reason)).await
    }

    async fn transition(
        &self,
        actor: &Actor,
        batch_id: Uuid,
        to: BatchStatus,
        reason: Option<&str>,
    ) -> WorkflowResult<BatchTransition> {
        let admin_id = actor.require_admin()?;
        if to == BatchStatus::Pending {
            return Err(WorkflowError::conflict(crate::error::ConflictKind::InvalidTransition {
                from: "ANY".to_string(),
                to: to.as_str().to_string(),
            }));
        }

        let max_wait_ms = settings::get_max_lock_wait_ms(&self.db).await?;
        let db = &self.db;
        let now = Utc::now();

        let step = retry_on_lock("batch_transition", max_wait_ms, || async move {
            let mut tx = db.begin().await?;

            let Some(current) = batches::get_status(&mut tx, batch_id).await? else {
                return Ok(TransitionStep::Missing);
            };
            if current == to {
                return Ok(TransitionStep::Unchanged(current));
            }

            if !batches::transition_status(&mut tx, batch_id, current, to, admin_id, reason, now).await? {
                return Err(agp_common::Error::Internal(format!(
                    "Batch {} left {} inside its own transaction",
                    batch_id,
                    current.as_str()
                )));
            }

            let certificate = match to {
                BatchStatus::Rejected => certificates::revoke(&mut tx, batch_id, now)
                    .await?
                    .map(CertificateChange::Revoked),
                _ => certificates::reinstate(&mut tx, batch_id, now)
                    .await?
                    .map(CertificateChange::Reinstated),
            };

            tx.commit().await?;
            Ok(TransitionStep::Moved { from: current, certificate })
        })
        .await?;

        let (previous_status, changed) = match step {
            TransitionStep::Missing => return Err(WorkflowError::NotFound(format!("Batch {}", batch_id))),
            TransitionStep::Unchanged(status) => {
                info!(batch_id = %batch_id, status = status.as_str(), actor = admin_id, "Batch already in requested status");
                (status, false)
            }
            TransitionStep::Moved { from, certificate } => {
                info!(
                    batch_id = %batch_id,
                    from = from.as_str(),
                    to = to.as_str(),
                    actor = admin_id,
                    reason = reason.unwrap_or(""),
                    "Batch status changed"
                );
                self.event_bus.emit_lossy(AgpEvent::BatchStatusChanged {
                    batch_id,
                    old_status: from.as_str().to_string(),
                    new_status: to.as_str().to_string(),
                    actor_id: admin_id.to_string(),
                    timestamp: now,
                });

                match certificate {
                    Some(CertificateChange::Revoked(certificate_id)) => {
                        info!(batch_id = %batch_id, certificate_id = %certificate_id, "Certificate revoked");
                        self.event_bus.emit_lossy(AgpEvent::CertificateRevoked {
                            batch_id,
                            certificate_id,
                            timestamp: now,
                        });
                    }
                    Some(CertificateChange::Reinstated(certificate_id)) => {
                        info!(batch_id = %batch_id, certificate_id = %certificate_id, "Certificate reinstated");
                        self.event_bus.emit_lossy(AgpEvent::CertificateReinstated {
                            batch_id,
                            certificate_id,
                            timestamp: now,
                        });
                    }
                    None => {}
                }
                (from, true)
            }
        };

        let (certificate, certificate_error) = if to == BatchStatus::Verified {
            match self.gate.maybe_issue_certificate(batch_id).await {
                Ok(result) => (Some(result), None),
                Err(e) => {
                    warn!(batch_id = %batch_id, error = %e, "Certificate issuance failed after verification");
                    (None, Some(e.to_string()))
                }
            }
        } else {
            (None, None)
        };

        Ok(BatchTransition {
            batch: load_batch(&self.db, batch_id).await?,
            previous_status,
            changed,
            certificate,
            certificate_error,
        })
    }

    /// Per-stage counts, missing stages and certificate eligibility
    pub async fn progress(&self, actor: &Actor, batch_id: Uuid) -> WorkflowResult<BatchProgress> {
        let batch = load_batch(&self.db, batch_id).await?;
        ensure_can_view(actor, &batch)?;

        let persisted = stages::list_stages(&self.db, batch_id).await?;
        let counts = verifications::stage_counts(&self.db, batch_id).await?;

        let stage_progress: Vec<StageProgress> = StageName::ALL
            .into_iter()
            .map(|name| {
                let stage = persisted.iter().find(|s| s.stage_name == name);
                let c = counts.get(&name).copied().unwrap_or_default();
                let image_count = stage.map(|s| s.image_urls.len()).unwrap_or(0);
                StageProgress {
                    stage: name,
                    status: stage.map(|s| s.status),
                    submitted: image_count >= MIN_STAGE_IMAGES,
                    image_count,
                    real: c.real,
                    fake: c.fake,
                    pending: c.pending,
                }
            })
            .collect();

        let missing_stages: Vec<StageName> = stage_progress
            .iter()
            .filter(|s| !s.submitted)
            .map(|s| s.stage)
            .collect();
        let pending_images = stage_progress.iter().map(|s| s.pending).sum();
        let fake_images: usize = stage_progress.iter().map(|s| s.fake).sum();

        Ok(BatchProgress {
            batch_id,
            status: batch.status,
            certificate_eligible: batch.status == BatchStatus::Verified
                && missing_stages.is_empty()
                && fake_images == 0,
            stages: stage_progress,
            missing_stages,
            pending_images,
            fake_images,
            certificate: batch.certificate,
        })
    }
}

fn is_unique_violation(error: &agp_common::Error) -> bool {
    matches!(error, agp_common::Error::Database(sqlx::Error::Database(db_err)) if db_err.is_unique_violation())
}
