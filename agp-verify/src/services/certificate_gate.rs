//! Certificate gate
//!
//! Re-evaluated after every mutation that could make a batch eligible. The
//! claim in `db::certificates` re-checks all conditions in one statement, so
//! any number of concurrent evaluations result in at most one issuer call.

use agp_common::events::{AgpEvent, EventBus};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::certificates::{self, ClaimOutcome};
use crate::db::batches;
use crate::error::{ConflictKind, WorkflowError, WorkflowResult};
use crate::models::{Actor, CertificateInfo};
use crate::services::certificate_issuer::{CertificateIssuer, CertificateRequest};

/// Why the gate did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoOpReason {
    /// Not VERIFIED, a stage below the minimum, or a FAKE image on a stage
    NotEligible,
    AlreadyIssued,
    IssuanceInProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateResult {
    Issued { certificate: CertificateInfo },
    NoOp { reason: NoOpReason },
}

#[derive(Clone)]
pub struct CertificateGate {
    db: SqlitePool,
    issuer: Arc<dyn CertificateIssuer>,
    event_bus: EventBus,
    issuer_timeout: Duration,
}

impl CertificateGate {
    pub fn new(db: SqlitePool, issuer: Arc<dyn CertificateIssuer>, event_bus: EventBus, issuer_timeout: Duration) -> Self {
        Self {
            db,
            issuer,
            event_bus,
            issuer_timeout,
        }
    }

    /// Issue the batch certificate if every gate condition holds
    ///
    /// Precondition failures are a silent no-op. Issuer failures release the
    /// claim and surface as `WorkflowError::Issuer`; batch status is never
    /// touched here.
    pub async fn maybe_issue_certificate(&self, batch_id: Uuid) -> WorkflowResult<CertificateResult> {
        let outcome = certificates::claim_issuance(&self.db, batch_id, Utc::now()).await?;

        match outcome {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::NotEligible => {
                return Ok(CertificateResult::NoOp {
                    reason: NoOpReason::NotEligible,
                })
            }
            ClaimOutcome::AlreadyIssued => {
                return Ok(CertificateResult::NoOp {
                    reason: NoOpReason::AlreadyIssued,
                })
            }
            ClaimOutcome::InProgress => {
                return Ok(CertificateResult::NoOp {
                    reason: NoOpReason::IssuanceInProgress,
                })
            }
        }

        match self.issue_claimed(batch_id).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if let Err(release_err) = certificates::release_claim(&self.db, batch_id).await {
                    warn!(batch_id = %batch_id, error = %release_err, "Failed to release issuance claim");
                }
                Err(e)
            }
        }
    }

    /// Explicit admin request: a certificate that exists or is being issued is a conflict
    pub async fn issue_on_request(&self, actor: &Actor, batch_id: Uuid) -> WorkflowResult<CertificateResult> {
        let admin_id = actor.require_admin()?;
        if batches::get_batch(&self.db, batch_id).await?.is_none() {
            return Err(WorkflowError::NotFound(format!("Batch {}", batch_id)));
        }

        info!(batch_id = %batch_id, actor = admin_id, "Certificate issuance requested");
        match self.maybe_issue_certificate(batch_id).await? {
            CertificateResult::NoOp {
                reason: NoOpReason::AlreadyIssued,
            } => Err(WorkflowError::conflict(ConflictKind::CertificateAlreadyIssued)),
            CertificateResult::NoOp {
                reason: NoOpReason::IssuanceInProgress,
            } => Err(WorkflowError::conflict(ConflictKind::CertificateIssuanceInProgress)),
            other => Ok(other),
        }
    }

    /// Evaluate the gate after some other mutation; failures are logged, not returned
    pub async fn evaluate_after_change(&self, batch_id: Uuid) -> Option<CertificateResult> {
        match self.maybe_issue_certificate(batch_id).await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(batch_id = %batch_id, error = %e, "Certificate gate evaluation failed");
                None
            }
        }
    }

    async fn issue_claimed(&self, batch_id: Uuid) -> WorkflowResult<CertificateResult> {
        let batch = batches::get_batch(&self.db, batch_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Batch {}", batch_id)))?;

        let request = CertificateRequest {
            batch_id,
            batch_code: batch.batch_code.clone(),
            farmer_id: batch.farmer_id.clone(),
            crop_name: batch.details.crop_name.clone(),
        };

        let issued = match tokio::time::timeout(self.issuer_timeout, self.issuer.issue_certificate(&request)).await {
            Ok(Ok(issued)) => issued,
            Ok(Err(e)) => {
                warn!(batch_id = %batch_id, error = %e, "Certificate issuer failed");
                return Err(WorkflowError::Issuer(e.to_string()));
            }
            Err(_) => {
                warn!(batch_id = %batch_id, timeout = ?self.issuer_timeout, "Certificate issuer timed out");
                return Err(WorkflowError::Issuer(format!(
                    "Issuer did not answer within {:?}",
                    self.issuer_timeout
                )));
            }
        };

        let row = certificates::complete_issuance(
            &self.db,
            batch_id,
            &issued.certificate_id,
            &issued.qr_payload,
            Utc::now(),
        )
        .await?;

        let certificate = row
            .info
            .clone()
            .ok_or_else(|| WorkflowError::Persistence(agp_common::Error::Internal("Issued certificate row incomplete".to_string())))?;

        info!(
            batch_id = %batch_id,
            certificate_id = %certificate.certificate_id,
            "Certificate issued"
        );
        self.event_bus.emit_lossy(AgpEvent::CertificateIssued {
            batch_id,
            certificate_id: certificate.certificate_id.clone(),
            timestamp: certificate.issued_at,
        });

        if let Some(revoked_at) = row.revoked_at {
            // Batch was rejected while the issuer was working
            warn!(batch_id = %batch_id, "Batch left VERIFIED during issuance; certificate stored revoked");
            self.event_bus.emit_lossy(AgpEvent::CertificateRevoked {
                batch_id,
                certificate_id: certificate.certificate_id.clone(),
                timestamp: revoked_at,
            });
        }

        Ok(CertificateResult::Issued { certificate })
    }
}
