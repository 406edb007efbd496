//! Workflow services
//!
//! - Triage of AI scores
//! - Stage submission with bounded fan-out of upload + scoring
//! - Batch lifecycle, moderation, appeals
//! - Certificate gate
//! - Adapters for the image store, AI validation, certificate issuer and
//!   reviewer notification

pub mod ai_validation;
pub mod appeal_manager;
pub mod batch_lifecycle;
pub mod certificate_gate;
pub mod certificate_issuer;
pub mod image_store;
pub mod moderation;
pub mod notifier;
pub mod stage_tracker;
pub mod triage;
pub mod workflow;

pub use ai_validation::{AiScore, AiValidationError, AiValidator, HttpAiValidator, ScoringContext, UnavailableAiValidator};
pub use appeal_manager::{AppealManager, ResolvedAppeal};
pub use batch_lifecycle::{BatchLifecycle, BatchTransition};
pub use certificate_gate::{CertificateGate, CertificateResult, NoOpReason};
pub use certificate_issuer::{
    CertificateIssuer, CertificateRequest, HttpCertificateIssuer, IssuedCertificate, IssuerError, LocalCertificateIssuer,
};
pub use image_store::{HttpImageStore, ImageStore, ImageUpload, LocalImageStore, StorageError, UploadContext};
pub use moderation::Moderation;
pub use notifier::{EventBusNotifier, ReviewerNotifier};
pub use stage_tracker::{RescoreReport, StageResult, StageSubmission, StageTracker, StageView, SubmittedImage};
pub use triage::{TriageEngine, TriageOutcome, TriageThresholds};
pub use workflow::{Collaborators, Workflow, WorkflowLimits};

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::batches;
use crate::error::{WorkflowError, WorkflowResult};
use crate::models::{Actor, Batch};

/// Load a batch or fail with NotFound
pub(crate) async fn load_batch(db: &SqlitePool, batch_id: Uuid) -> WorkflowResult<Batch> {
    batches::get_batch(db, batch_id)
        .await?
        .ok_or_else(|| WorkflowError::NotFound(format!("Batch {}", batch_id)))
}

/// Admins see every batch; farmers only their own
pub(crate) fn ensure_can_view(actor: &Actor, batch: &Batch) -> WorkflowResult<()> {
    match actor {
        Actor::Admin(_) => Ok(()),
        Actor::Farmer(id) if *id == batch.farmer_id => Ok(()),
        Actor::Farmer(id) => Err(WorkflowError::Forbidden(format!(
            "Batch {} does not belong to farmer {}",
            batch.batch_code, id
        ))),
    }
}

/// Farmer-only action on the farmer's own batch
pub(crate) fn ensure_owner(actor: &Actor, batch: &Batch) -> WorkflowResult<String> {
    let farmer_id = actor.require_farmer()?;
    if farmer_id != batch.farmer_id {
        return Err(WorkflowError::Forbidden(format!(
            "Batch {} does not belong to farmer {}",
            batch.batch_code, farmer_id
        )));
    }
    Ok(farmer_id.to_string())
}
