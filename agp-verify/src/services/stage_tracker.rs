//! Stage submission
//!
//! A submission uploads and scores every image with a bounded fan-out, waits
//! for all of them, triages the scores, then writes the records and the stage
//! row in one transaction. A stage only appears (or grows) once the persisted
//! image count reaches the minimum; records of images uploaded by a failed
//! submission stay behind so they can be re-scored or reused.

use agp_common::db::retry_on_lock;
use agp_common::events::{AgpEvent, EventBus};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ai_validation::{AiScore, AiValidationError, AiValidator, ScoringContext};
use super::certificate_gate::{CertificateGate, CertificateResult};
use super::image_store::{ImageStore, ImageUpload, StorageError, UploadContext};
use super::triage::TriageEngine;
use super::workflow::WorkflowLimits;
use super::{ensure_can_view, ensure_owner, load_batch};
use crate::db::stages::{self, StageAppend};
use crate::db::{settings, verifications};
use crate::error::{FailedUpload, UploadFailure, WorkflowError, WorkflowResult};
use crate::models::{
    Actor, AiAction, RecordKey, Stage, StageName, StageStatus, VerificationRecord, MIN_STAGE_IMAGES,
    SYSTEM_VERIFIER_ID,
};

/// Farmer's stage submission
#[derive(Debug, Clone)]
pub struct StageSubmission {
    pub batch_id: Uuid,
    pub stage: StageName,
    /// In the order the farmer wants them shown
    pub images: Vec<ImageUpload>,
    pub notes: Option<String>,
    pub status: Option<StageStatus>,
}

/// An image stored by this submission with its initial verification state
#[derive(Debug, Clone, Serialize)]
pub struct SubmittedImage {
    pub image_url: String,
    pub record: VerificationRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: Stage,
    pub images: Vec<SubmittedImage>,
    /// Images that could not be stored; the stage was still persisted
    pub failed_uploads: Vec<FailedUpload>,
    /// Present when this submission completed an eligible batch
    pub certificate: Option<CertificateResult>,
}

/// One of the seven stages of a batch, as seen by farmers and reviewers
#[derive(Debug, Clone, Serialize)]
pub struct StageView {
    pub stage: StageName,
    pub label: &'static str,
    pub submitted: bool,
    pub persisted: Option<Stage>,
    /// Records of the stage's images, in image order
    pub records: Vec<VerificationRecord>,
    /// Records of images uploaded by submissions that never reached the minimum
    pub unattached_records: Vec<VerificationRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RescoreReport {
    pub attempted: usize,
    pub scored: usize,
    pub auto_approved: usize,
    pub still_unscored: usize,
}

enum ImageOutcome {
    Stored { url: String, score: Option<AiScore> },
    Failed(FailedUpload),
}

#[derive(Clone)]
pub struct StageTracker {
    db: SqlitePool,
    event_bus: EventBus,
    image_store: Arc<dyn ImageStore>,
    ai_validator: Arc<dyn AiValidator>,
    triage: Arc<RwLock<TriageEngine>>,
    gate: CertificateGate,
    limits: WorkflowLimits,
}

impl StageTracker {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        image_store: Arc<dyn ImageStore>,
        ai_validator: Arc<dyn AiValidator>,
        triage: Arc<RwLock<TriageEngine>>,
        gate: CertificateGate,
        limits: WorkflowLimits,
    ) -> Self {
        Self {
            db,
            event_bus,
            image_store,
            ai_validator,
            triage,
            gate,
            limits,
        }
    }

    /// Upload, score, triage and persist a stage submission
    pub async fn submit_stage(&self, actor: &Actor, submission: StageSubmission) -> WorkflowResult<StageResult> {
        let farmer_id = actor.require_farmer()?.to_string();
        let StageSubmission {
            batch_id,
            stage,
            images,
            notes,
            status,
        } = submission;

        if images.len() < MIN_STAGE_IMAGES {
            return Err(WorkflowError::Validation(format!(
                "Stage {} requires at least {} images, got {}",
                stage.label(),
                MIN_STAGE_IMAGES,
                images.len()
            )));
        }
        if let Some(index) = images.iter().position(|i| i.bytes.is_empty()) {
            return Err(WorkflowError::Validation(format!(
                "Image {} ({}) is empty",
                index, images[index].file_name
            )));
        }

        let batch = load_batch(&self.db, batch_id).await?;
        ensure_owner(actor, &batch)?;

        let upload_context = UploadContext {
            farmer_id: farmer_id.clone(),
            batch_id,
            stage,
        };
        let scoring_context = ScoringContext {
            batch_id,
            stage,
            farmer_id: farmer_id.clone(),
            crop_name: batch.details.crop_name.clone(),
        };
        let engine = *self.triage.read().await;

        info!(
            batch_id = %batch_id,
            stage = %stage,
            images = images.len(),
            "Processing stage submission"
        );

        let upload_context = &upload_context;
        let scoring_context = &scoring_context;
        // Built up front: mapping borrowed items inside the stream defeats Send inference for handlers
        let pending: Vec<_> = images
            .iter()
            .enumerate()
            .map(|(index, image)| async move {
                (index, self.process_image(index, image, upload_context, scoring_context).await)
            })
            .collect();
        let mut outcomes: Vec<(usize, ImageOutcome)> = stream::iter(pending)
            .buffer_unordered(self.limits.max_concurrent_scoring.max(1))
            .collect()
            .await;
        outcomes.sort_by_key(|(index, _)| *index);

        let now = Utc::now();
        let mut records = Vec::new();
        let mut failed = Vec::new();
        for (_, outcome) in outcomes {
            match outcome {
                ImageOutcome::Stored { url, score } => {
                    let triage = engine.evaluate(score.as_ref(), now);
                    records.push(VerificationRecord {
                        key: RecordKey::new(batch_id, stage, url),
                        farmer_id: farmer_id.clone(),
                        decision: triage.decision,
                        ai_validation: triage.ai_validation,
                        version: 1,
                        created_at: now,
                        updated_at: now,
                    });
                }
                ImageOutcome::Failed(failure) => failed.push(failure),
            }
        }
        let urls: Vec<String> = records.iter().map(|r| r.key.image_url.clone()).collect();

        let (persisted, inserted) = if records.is_empty() {
            (None, Vec::new())
        } else {
            self.persist(&records, batch_id, stage, &urls, notes.as_deref(), status, now)
                .await?
        };

        let Some(persisted) = persisted else {
            let persisted_image_count = stages::get_stage(&self.db, batch_id, stage)
                .await?
                .map(|s| s.image_urls.len())
                .unwrap_or(0);
            warn!(
                batch_id = %batch_id,
                stage = %stage,
                uploaded = urls.len(),
                failed = failed.len(),
                persisted_image_count,
                "Stage submission left below minimum image count"
            );
            return Err(WorkflowError::UploadFailed(UploadFailure {
                stage: stage.to_string(),
                uploaded: urls,
                failed,
                persisted_image_count,
            }));
        };

        let mut images_out = Vec::with_capacity(records.len());
        for (record, was_inserted) in records.into_iter().zip(inserted) {
            let record = if was_inserted {
                self.event_bus.emit_lossy(AgpEvent::ImageTriaged {
                    batch_id,
                    stage: stage.to_string(),
                    image_url: record.key.image_url.clone(),
                    ai_action: record
                        .ai_validation
                        .as_ref()
                        .map(|a| a.ai_action)
                        .unwrap_or(AiAction::FlagForHuman)
                        .as_str()
                        .to_string(),
                    scored: record.ai_validation.is_some(),
                    timestamp: now,
                });
                record
            } else {
                // Store handed back a URL that already had a record
                verifications::get_record(&self.db, &record.key).await?.unwrap_or(record)
            };
            images_out.push(SubmittedImage {
                image_url: record.key.image_url.clone(),
                record,
            });
        }

        let pending_count = images_out.iter().filter(|i| i.record.is_pending()).count();
        self.event_bus.emit_lossy(AgpEvent::StageSubmitted {
            batch_id,
            stage: stage.to_string(),
            image_count: persisted.image_urls.len(),
            pending_count,
            timestamp: now,
        });

        info!(
            batch_id = %batch_id,
            stage = %stage,
            stored = images_out.len(),
            failed = failed.len(),
            pending = pending_count,
            total_images = persisted.image_urls.len(),
            "Stage submission persisted"
        );

        let certificate = match self.gate.evaluate_after_change(batch_id).await {
            Some(result @ CertificateResult::Issued { .. }) => Some(result),
            _ => None,
        };

        Ok(StageResult {
            stage: persisted,
            images: images_out,
            failed_uploads: failed,
            certificate,
        })
    }

    /// Write records and the stage row atomically
    ///
    /// Returns the stage (None when still below the minimum) and, per record,
    /// whether it was newly inserted.
    #[allow(clippy::too_many_arguments)]
    async fn persist(
        &self,
        records: &[VerificationRecord],
        batch_id: Uuid,
        stage: StageName,
        urls: &[String],
        notes: Option<&str>,
        status: Option<StageStatus>,
        at: chrono::DateTime<Utc>,
    ) -> WorkflowResult<(Option<Stage>, Vec<bool>)> {
        let max_wait_ms = settings::get_max_lock_wait_ms(&self.db).await?;
        let db = &self.db;

        let result = retry_on_lock("submit_stage", max_wait_ms, || async move {
            let mut tx = db.begin().await?;

            let mut inserted = Vec::with_capacity(records.len());
            for record in records {
                inserted.push(verifications::insert_if_absent(&mut tx, record).await?);
            }

            let stage = stages::upsert_append(
                &mut tx,
                &StageAppend {
                    batch_id,
                    stage,
                    image_urls: urls,
                    notes,
                    status,
                    min_images: MIN_STAGE_IMAGES,
                    at,
                },
            )
            .await?;

            tx.commit().await?;
            Ok((stage, inserted))
        })
        .await?;

        Ok(result)
    }

    async fn process_image(
        &self,
        index: usize,
        image: &ImageUpload,
        upload_context: &UploadContext,
        scoring_context: &ScoringContext,
    ) -> ImageOutcome {
        match self.upload_with_retry(image, upload_context).await {
            Ok(url) => {
                let score = self.score_with_timeout(&url, scoring_context).await;
                ImageOutcome::Stored { url, score }
            }
            Err(error) => ImageOutcome::Failed(FailedUpload {
                index,
                file_name: image.file_name.clone(),
                error,
            }),
        }
    }

    async fn upload_with_retry(&self, image: &ImageUpload, context: &UploadContext) -> Result<String, String> {
        let attempts = self.limits.upload_retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.limits.upload_timeout, self.image_store.upload_image(image, context)).await {
                Ok(Ok(url)) => return Ok(url),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = StorageError::Timeout(self.limits.upload_timeout).to_string(),
            }
            warn!(
                batch_id = %context.batch_id,
                stage = %context.stage,
                file_name = %image.file_name,
                attempt,
                attempts,
                error = %last_error,
                "Image upload failed"
            );
        }

        Err(last_error)
    }

    /// Score one image; any failure means "AI unavailable"
    async fn score_with_timeout(&self, image_url: &str, context: &ScoringContext) -> Option<AiScore> {
        match tokio::time::timeout(self.limits.ai_timeout, self.ai_validator.score_image(image_url, context)).await {
            Ok(Ok(score)) => Some(score),
            Ok(Err(AiValidationError::NotConfigured)) => {
                debug!(image_url, "No AI validation service configured");
                None
            }
            Ok(Err(e)) => {
                warn!(image_url, error = %e, "AI validation failed, image flagged for human review");
                None
            }
            Err(_) => {
                warn!(
                    image_url,
                    timeout = ?self.limits.ai_timeout,
                    "AI validation timed out, image flagged for human review"
                );
                None
            }
        }
    }

    /// Re-run scoring for records of a batch that have no AI payload
    pub async fn rescore_batch(&self, actor: &Actor, batch_id: Uuid) -> WorkflowResult<RescoreReport> {
        let admin_id = actor.require_admin()?.to_string();
        let batch = load_batch(&self.db, batch_id).await?;
        let unscored = verifications::list_unscored(&self.db, batch_id).await?;
        let engine = *self.triage.read().await;

        info!(batch_id = %batch_id, records = unscored.len(), actor = %admin_id, "Re-scoring unscored images");

        let crop_name = &batch.details.crop_name;
        let results: Vec<(VerificationRecord, Option<AiScore>)> = stream::iter(unscored)
            .map(|record| async move {
                let context = ScoringContext {
                    batch_id,
                    stage: record.key.stage,
                    farmer_id: record.farmer_id.clone(),
                    crop_name: crop_name.clone(),
                };
                let score = self.score_with_timeout(&record.key.image_url, &context).await;
                (record, score)
            })
            .buffer_unordered(self.limits.max_concurrent_scoring.max(1))
            .collect()
            .await;

        let mut report = RescoreReport {
            attempted: results.len(),
            ..Default::default()
        };
        let now = Utc::now();
        let mut conn = self.db.acquire().await?;

        for (record, score) in results {
            let outcome = engine.evaluate(score.as_ref(), now);
            let Some(ai) = outcome.ai_validation else {
                report.still_unscored += 1;
                continue;
            };

            // None: scored concurrently by another re-score
            let Some(updated) = verifications::attach_ai_payload(&mut conn, &record.key, &ai, now).await? else {
                continue;
            };
            report.scored += 1;

            self.event_bus.emit_lossy(AgpEvent::ImageTriaged {
                batch_id,
                stage: record.key.stage.to_string(),
                image_url: record.key.image_url.clone(),
                ai_action: ai.ai_action.as_str().to_string(),
                scored: true,
                timestamp: now,
            });

            if record.is_pending() && !updated.is_pending() {
                report.auto_approved += 1;
                self.event_bus.emit_lossy(AgpEvent::VerificationUpdated {
                    batch_id,
                    stage: record.key.stage.to_string(),
                    image_url: record.key.image_url.clone(),
                    status: updated.verification_status().map(|s| s.as_str().to_string()),
                    version: updated.version,
                    actor_id: SYSTEM_VERIFIER_ID.to_string(),
                    timestamp: now,
                });
            }
        }
        drop(conn);

        info!(
            batch_id = %batch_id,
            attempted = report.attempted,
            scored = report.scored,
            auto_approved = report.auto_approved,
            still_unscored = report.still_unscored,
            "Re-scoring finished"
        );

        if report.auto_approved > 0 {
            self.gate.evaluate_after_change(batch_id).await;
        }

        Ok(report)
    }

    /// All seven stages of a batch with their records
    pub async fn list_stage_views(&self, actor: &Actor, batch_id: Uuid) -> WorkflowResult<Vec<StageView>> {
        let batch = load_batch(&self.db, batch_id).await?;
        ensure_can_view(actor, &batch)?;

        let persisted = stages::list_stages(&self.db, batch_id).await?;
        let records = verifications::list_for_batch(&self.db, batch_id).await?;

        let views = StageName::ALL
            .into_iter()
            .map(|name| {
                let stage = persisted.iter().find(|s| s.stage_name == name).cloned();
                let image_urls: &[String] = stage.as_ref().map(|s| s.image_urls.as_slice()).unwrap_or(&[]);

                let attached = image_urls
                    .iter()
                    .filter_map(|url| {
                        records
                            .iter()
                            .find(|r| r.key.stage == name && &r.key.image_url == url)
                            .cloned()
                    })
                    .collect();
                let unattached = records
                    .iter()
                    .filter(|r| r.key.stage == name && !image_urls.contains(&r.key.image_url))
                    .cloned()
                    .collect();

                StageView {
                    stage: name,
                    label: name.label(),
                    submitted: stage.as_ref().is_some_and(|s| s.is_submitted()),
                    persisted: stage,
                    records: attached,
                    unattached_records: unattached,
                }
            })
            .collect();

        Ok(views)
    }
}
