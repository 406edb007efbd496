//! End-to-end workflow scenarios: submission, triage, moderation, batch lifecycle

mod helpers;

use agp_common::events::AgpEvent;
use agp_verify::error::{ConflictKind, WorkflowError};
use agp_verify::models::{AiAction, BatchStatus, Decision, StageName, VerificationStatus};
use agp_verify::services::{CertificateResult, NoOpReason, TriageThresholds};
use helpers::*;
use std::time::Duration;

#[tokio::test]
async fn test_single_image_rejected_before_any_external_call() {
    let env = setup().await;
    let batch = env.create_batch().await;

    let err = env
        .try_submit(batch.batch_id, StageName::Sowing, &["only.jpg"])
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::Validation(_)));
    assert_eq!(env.store.attempts(), 0);
    assert_eq!(env.ai.calls(), 0);

    let views = env.workflow.stages.list_stage_views(&farmer(), batch.batch_id).await.unwrap();
    assert!(views.iter().all(|v| v.persisted.is_none()));
}

#[tokio::test]
async fn test_sowing_submission_triages_each_image() {
    let env = setup().await;
    let batch = env.create_batch().await;
    env.ai.script("clean.jpg", Script::Score { deepfake: 0.1, quality: 0.9 });
    env.ai.script("unsure.jpg", Script::Score { deepfake: 0.5, quality: 0.9 });

    let mut rx = env.event_bus.subscribe();
    let result = env
        .submit(batch.batch_id, StageName::Sowing, &["clean.jpg", "unsure.jpg"])
        .await;

    assert_eq!(result.stage.image_urls.len(), 2);
    assert!(result.stage.is_submitted());
    assert!(result.failed_uploads.is_empty());
    // Farmer order preserved
    assert!(result.stage.image_urls[0].ends_with("/clean.jpg"));
    assert!(result.stage.image_urls[1].ends_with("/unsure.jpg"));

    let approved = &result.images[0].record;
    assert_eq!(approved.verification_status(), Some(VerificationStatus::Real));
    assert!(approved.is_system_decision());
    assert_eq!(approved.ai_validation.as_ref().unwrap().ai_action, AiAction::AutoApprove);

    let flagged = &result.images[1].record;
    assert!(flagged.is_pending());
    assert_eq!(flagged.ai_validation.as_ref().unwrap().ai_action, AiAction::FlagForHuman);

    let mut triaged = 0;
    let mut submitted = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            AgpEvent::ImageTriaged { .. } => triaged += 1,
            AgpEvent::StageSubmitted { pending_count, .. } => submitted = Some(pending_count),
            _ => {}
        }
    }
    assert_eq!(triaged, 2);
    assert_eq!(submitted, Some(1));

    let progress = env.workflow.batches.progress(&farmer(), batch.batch_id).await.unwrap();
    let sowing = progress.stages.iter().find(|s| s.stage == StageName::Sowing).unwrap();
    assert!(sowing.submitted);
    assert_eq!((sowing.real, sowing.fake, sowing.pending), (1, 0, 1));
    assert_eq!(progress.missing_stages.len(), 6);
    assert!(!progress.certificate_eligible);
}

#[tokio::test]
async fn test_high_deepfake_score_awaits_human_and_leads_queue() {
    let env = setup().await;
    let batch = env.create_batch().await;
    env.ai.script("suspicious.jpg", Script::Score { deepfake: 0.95, quality: 0.8 });

    env.submit(batch.batch_id, StageName::Germination, &["ordinary.jpg", "suspicious.jpg"])
        .await;

    let queue = env
        .workflow
        .moderation
        .review_queue(&admin(), Some(batch.batch_id), None)
        .await
        .unwrap();

    assert_eq!(queue.len(), 2);
    assert!(queue[0].key.image_url.ends_with("/suspicious.jpg"));
    assert!(queue[0].awaits_rejection_confirmation());
    assert!(queue[0].is_pending());
}

#[tokio::test]
async fn test_ai_timeout_flags_without_failing_submission() {
    let env = setup().await;
    let batch = env.create_batch().await;
    env.ai.set_default(Script::Hang);

    let result = env
        .submit(batch.batch_id, StageName::Flowering, &["one.jpg", "two.jpg"])
        .await;

    assert_eq!(result.images.len(), 2);
    for image in &result.images {
        assert!(image.record.ai_validation.is_none());
        assert!(matches!(
            image.record.decision,
            Decision::Unreviewed {
                ai_action: AiAction::FlagForHuman,
                ..
            }
        ));
    }
}

#[tokio::test]
async fn test_resubmission_appends_and_keeps_existing_records() {
    let env = setup().await;
    let batch = env.create_batch().await;

    let first = env.submit(batch.batch_id, StageName::Harvesting, &["a.jpg", "b.jpg"]).await;
    let second = env.submit(batch.batch_id, StageName::Harvesting, &["c.jpg", "d.jpg"]).await;

    assert_eq!(second.stage.image_urls.len(), 4);
    assert_eq!(&second.stage.image_urls[..2], &first.stage.image_urls[..]);
    assert_eq!(second.stage.stage_id, first.stage.stage_id);

    let views = env.workflow.stages.list_stage_views(&farmer(), batch.batch_id).await.unwrap();
    let harvesting = views.iter().find(|v| v.stage == StageName::Harvesting).unwrap();
    assert_eq!(harvesting.records.len(), 4);
    assert!(harvesting.records.iter().all(|r| r.version == 1));
}

#[tokio::test]
async fn test_partial_upload_failure_still_persists_stage() {
    let env = setup().await;
    let batch = env.create_batch().await;
    env.store.fail_file("broken.jpg");

    let result = env
        .submit(batch.batch_id, StageName::Sowing, &["a.jpg", "broken.jpg", "c.jpg"])
        .await;

    assert_eq!(result.stage.image_urls.len(), 2);
    assert_eq!(result.failed_uploads.len(), 1);
    assert_eq!(result.failed_uploads[0].index, 1);
    assert_eq!(result.failed_uploads[0].file_name, "broken.jpg");
    // One attempt plus one retry for the broken image
    assert_eq!(env.store.attempts(), 4);
}

#[tokio::test]
async fn test_scoring_fan_out_respects_concurrency_cap() {
    let env = setup().await;
    let batch = env.create_batch().await;
    env.ai.set_latency(Duration::from_millis(50));

    let names: Vec<String> = (0..10).map(|i| format!("img-{}.jpg", i)).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let result = env.submit(batch.batch_id, StageName::Sowing, &names).await;

    assert_eq!(result.stage.image_urls.len(), 10);
    assert!(result.images.iter().all(|i| i.record.ai_validation.is_some()));
    assert_eq!(env.ai.calls(), 10);
    let peak = env.ai.peak_in_flight();
    assert!(peak <= test_limits().max_concurrent_scoring, "peak in flight was {}", peak);
    assert!(peak >= 2, "images were scored one at a time");
}

#[tokio::test]
async fn test_stalled_upload_times_out_and_is_retried() {
    let env = setup().await;
    let batch = env.create_batch().await;
    env.store.hang_file("stuck.jpg");

    let result = env
        .submit(batch.batch_id, StageName::Sowing, &["a.jpg", "stuck.jpg", "c.jpg"])
        .await;

    assert_eq!(result.stage.image_urls.len(), 2);
    assert_eq!(result.failed_uploads.len(), 1);
    assert_eq!(result.failed_uploads[0].index, 1);
    assert_eq!(result.failed_uploads[0].file_name, "stuck.jpg");
    assert!(result.failed_uploads[0].error.contains("timed out"), "{}", result.failed_uploads[0].error);
    // Both attempts on the stalled image hit the upload timeout
    assert_eq!(env.store.attempts(), 4);
}

#[tokio::test]
async fn test_failed_submission_leaves_recoverable_records() {
    let env = setup().await;
    let batch = env.create_batch().await;
    env.store.fail_file("broken.jpg");

    let err = env
        .try_submit(batch.batch_id, StageName::PostHarvest, &["good.jpg", "broken.jpg"])
        .await
        .unwrap_err();

    let WorkflowError::UploadFailed(failure) = err else {
        panic!("expected UploadFailed, got {:?}", err);
    };
    assert_eq!(failure.uploaded.len(), 1);
    assert_eq!(failure.failed.len(), 1);
    assert_eq!(failure.persisted_image_count, 0);

    let views = env.workflow.stages.list_stage_views(&farmer(), batch.batch_id).await.unwrap();
    let post_harvest = views.iter().find(|v| v.stage == StageName::PostHarvest).unwrap();
    assert!(post_harvest.persisted.is_none());
    assert!(!post_harvest.submitted);
    assert_eq!(post_harvest.unattached_records.len(), 1);
    assert_eq!(post_harvest.unattached_records[0].key.image_url, failure.uploaded[0]);
}

#[tokio::test]
async fn test_rescore_after_ai_outage_applies_triage_to_pending_records() {
    let env = setup().await;
    let batch = env.create_batch().await;
    env.ai.set_default(Script::Fail);

    let result = env.submit(batch.batch_id, StageName::Sowing, &["a.jpg", "b.jpg"]).await;
    assert!(result.images.iter().all(|i| i.record.ai_validation.is_none()));

    // A human decision made during the outage must survive re-scoring
    let decided = key_of(&result, 1);
    env.mark_fake(&decided).await;

    env.ai.set_default(Script::Score { deepfake: 0.05, quality: 0.95 });
    let report = env.workflow.stages.rescore_batch(&admin(), batch.batch_id).await.unwrap();

    assert_eq!(report.attempted, 2);
    assert_eq!(report.scored, 2);
    assert_eq!(report.auto_approved, 1);
    assert_eq!(report.still_unscored, 0);

    let views = env.workflow.stages.list_stage_views(&admin(), batch.batch_id).await.unwrap();
    let sowing = views.iter().find(|v| v.stage == StageName::Sowing).unwrap();
    assert_eq!(sowing.records[0].verification_status(), Some(VerificationStatus::Real));
    assert_eq!(sowing.records[1].verification_status(), Some(VerificationStatus::Fake));
    assert!(sowing.records[1].ai_validation.is_some());

    // Nothing left to score
    let again = env.workflow.stages.rescore_batch(&admin(), batch.batch_id).await.unwrap();
    assert_eq!(again.attempted, 0);
}

#[tokio::test]
async fn test_farmer_cannot_submit_to_another_farmers_batch() {
    let env = setup().await;
    let batch = env.create_batch().await;

    let err = env
        .workflow
        .stages
        .submit_stage(
            &other_farmer(),
            agp_verify::services::StageSubmission {
                batch_id: batch.batch_id,
                stage: StageName::Sowing,
                images: images(&["a.jpg", "b.jpg"]),
                notes: None,
                status: None,
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::Forbidden(_)));
    assert_eq!(env.store.attempts(), 0);
}

#[tokio::test]
async fn test_fake_decision_requires_reason_and_detects_stale_writes() {
    let env = setup().await;
    let batch = env.create_batch().await;
    let result = env.submit(batch.batch_id, StageName::Sowing, &["a.jpg", "b.jpg"]).await;
    let key = key_of(&result, 0);

    let err = env
        .workflow
        .moderation
        .decide(&admin(), &key, VerificationStatus::Fake, Some("   "), None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));

    let decided = env
        .workflow
        .moderation
        .decide(&admin(), &key, VerificationStatus::Fake, Some("Stock photo"), Some(1))
        .await
        .unwrap();
    assert_eq!(decided.version, 2);
    assert_eq!(decided.rejection_reason(), Some("Stock photo"));

    // A client still holding version 1 is told it is stale
    let err = env
        .workflow
        .moderation
        .decide(&admin(), &key, VerificationStatus::Real, None, Some(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::StateConflict(ConflictKind::StaleVersion { expected: 1, actual: 2 })
    ));

    // Farmers never moderate
    let err = env.workflow.moderation.reset(&farmer(), &key, None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Forbidden(_)));
}

#[tokio::test]
async fn test_reset_and_flag_preserve_ai_payload() {
    let env = setup().await;
    let batch = env.create_batch().await;
    env.ai.set_default(Script::Score { deepfake: 0.1, quality: 0.8 });
    let result = env.submit(batch.batch_id, StageName::Sowing, &["a.jpg", "b.jpg"]).await;
    let key = key_of(&result, 0);
    let payload = result.images[0].record.ai_validation.clone();
    assert!(payload.is_some());

    let reset = env.workflow.moderation.reset(&admin(), &key, None).await.unwrap();
    assert!(reset.is_pending());
    assert_eq!(reset.rejection_reason(), None);
    assert_eq!(reset.ai_validation, payload);

    let flagged = env
        .workflow
        .moderation
        .flag(&admin(), &key, Some("Check the field boundary"), None)
        .await
        .unwrap();
    assert_eq!(flagged.ai_validation, payload);
    assert_eq!(flagged.version, reset.version + 1);
    assert!(matches!(flagged.decision, Decision::Unreviewed { flagged: true, .. }));
}

#[tokio::test]
async fn test_verify_issues_certificate_once() {
    let env = setup().await;
    let batch = env.create_batch().await;
    env.complete_all_stages(batch.batch_id).await;

    // Completing stages alone never certifies a PENDING batch
    assert_eq!(env.issuer.calls(), 0);

    let transition = env.workflow.batches.verify_batch(&admin(), batch.batch_id).await.unwrap();
    assert!(transition.changed);
    assert_eq!(transition.previous_status, BatchStatus::Pending);
    assert_eq!(transition.batch.status, BatchStatus::Verified);
    assert_eq!(transition.batch.verified_by.as_deref(), Some(ADMIN));
    assert!(matches!(transition.certificate, Some(CertificateResult::Issued { .. })));
    assert!(transition.batch.certificate.is_some());

    let again = env.workflow.batches.verify_batch(&admin(), batch.batch_id).await.unwrap();
    assert!(!again.changed);
    assert!(matches!(
        again.certificate,
        Some(CertificateResult::NoOp {
            reason: NoOpReason::AlreadyIssued
        })
    ));
    assert_eq!(env.issuer.calls(), 1);
}

#[tokio::test]
async fn test_verified_batch_with_missing_stage_gets_no_certificate() {
    let env = setup().await;
    let batch = env.create_batch().await;
    for stage in &StageName::ALL[..6] {
        env.submit(batch.batch_id, *stage, &["a.jpg", "b.jpg"]).await;
    }

    let transition = env.workflow.batches.verify_batch(&admin(), batch.batch_id).await.unwrap();
    assert_eq!(transition.batch.status, BatchStatus::Verified);
    assert!(matches!(
        transition.certificate,
        Some(CertificateResult::NoOp {
            reason: NoOpReason::NotEligible
        })
    ));
    assert!(transition.batch.certificate.is_none());

    // The last stage completes the gate without another admin action
    let result = env
        .submit(batch.batch_id, StageName::PostHarvest, &["a.jpg", "b.jpg"])
        .await;
    assert!(matches!(result.certificate, Some(CertificateResult::Issued { .. })));
    assert_eq!(env.issuer.calls(), 1);
}

#[tokio::test]
async fn test_revocation_hides_and_reverify_reinstates_same_certificate() {
    let env = setup().await;
    let batch = env.create_batch().await;
    env.complete_all_stages(batch.batch_id).await;

    let verified = env.workflow.batches.verify_batch(&admin(), batch.batch_id).await.unwrap();
    let certificate_id = verified.batch.certificate.clone().unwrap().certificate_id;

    let err = env
        .workflow
        .batches
        .reject_batch(&admin(), batch.batch_id, "  ")
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));

    let rejected = env
        .workflow
        .batches
        .reject_batch(&admin(), batch.batch_id, "Field audit failed")
        .await
        .unwrap();
    assert_eq!(rejected.batch.status, BatchStatus::Rejected);
    assert_eq!(rejected.batch.rejection_reason.as_deref(), Some("Field audit failed"));
    assert!(rejected.batch.certificate.is_none());
    assert!(rejected.batch.verified_at.is_none());

    let reverified = env.workflow.batches.verify_batch(&admin(), batch.batch_id).await.unwrap();
    assert_eq!(reverified.batch.certificate.unwrap().certificate_id, certificate_id);
    assert!(reverified.batch.rejection_reason.is_none());
    assert_eq!(env.issuer.calls(), 1);
}

#[tokio::test]
async fn test_issuer_failure_never_reverts_verification() {
    let env = setup().await;
    let batch = env.create_batch().await;
    env.complete_all_stages(batch.batch_id).await;
    env.issuer.set_failing(true);

    let transition = env.workflow.batches.verify_batch(&admin(), batch.batch_id).await.unwrap();
    assert_eq!(transition.batch.status, BatchStatus::Verified);
    assert!(transition.certificate.is_none());
    assert!(transition.certificate_error.is_some());
    assert!(transition.batch.certificate.is_none());

    env.issuer.set_failing(false);
    let result = env
        .workflow
        .certificates
        .issue_on_request(&admin(), batch.batch_id)
        .await
        .unwrap();
    assert!(matches!(result, CertificateResult::Issued { .. }));

    let err = env
        .workflow
        .certificates
        .issue_on_request(&admin(), batch.batch_id)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::StateConflict(ConflictKind::CertificateAlreadyIssued)));
}

#[tokio::test]
async fn test_fake_image_blocks_certificate_until_cleared() {
    let env = setup().await;
    let batch = env.create_batch().await;
    env.complete_all_stages(batch.batch_id).await;

    let views = env.workflow.stages.list_stage_views(&admin(), batch.batch_id).await.unwrap();
    let key = views[2].records[0].key.clone();
    env.mark_fake(&key).await;

    let transition = env.workflow.batches.verify_batch(&admin(), batch.batch_id).await.unwrap();
    assert!(matches!(
        transition.certificate,
        Some(CertificateResult::NoOp {
            reason: NoOpReason::NotEligible
        })
    ));
    let progress = env.workflow.batches.progress(&admin(), batch.batch_id).await.unwrap();
    assert_eq!(progress.fake_images, 1);
    assert!(!progress.certificate_eligible);

    // Clearing the decision re-evaluates the gate
    env.workflow.moderation.reset(&admin(), &key, None).await.unwrap();
    let batch = env.workflow.batches.get_batch(&admin(), batch.batch_id).await.unwrap();
    assert!(batch.certificate.is_some());
    assert_eq!(env.issuer.calls(), 1);
}

#[tokio::test]
async fn test_farmer_visibility_and_listing() {
    let env = setup().await;
    let mine = env.create_batch().await;
    let theirs = env.workflow.batches.create_batch(&other_farmer(), wheat()).await.unwrap();

    assert!(mine.batch_code.starts_with("AGP-"));
    assert_ne!(mine.batch_code, theirs.batch_code);

    let err = env.workflow.batches.get_batch(&farmer(), theirs.batch_id).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Forbidden(_)));

    let listed = env.workflow.batches.list_batches(&farmer(), None, None).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].batch_id, mine.batch_id);

    let all = env.workflow.batches.list_batches(&admin(), None, Some(BatchStatus::Pending)).await.unwrap();
    assert_eq!(all.len(), 2);

    let by_code = env.workflow.batches.get_batch_by_code(&admin(), &mine.batch_code).await.unwrap();
    assert_eq!(by_code.batch_id, mine.batch_id);

    let err = env.workflow.batches.create_batch(&admin(), wheat()).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Forbidden(_)));
}

#[tokio::test]
async fn test_threshold_update_applies_to_next_submission() {
    let env = setup().await;
    let batch = env.create_batch().await;
    env.ai.set_default(Script::Score { deepfake: 0.4, quality: 0.9 });

    let first = env.submit(batch.batch_id, StageName::Sowing, &["a.jpg", "b.jpg"]).await;
    assert!(first.images.iter().all(|i| i.record.is_pending()));

    let invalid = TriageThresholds {
        low_threshold: 0.8,
        high_threshold: 0.6,
        min_quality: 0.4,
    };
    assert!(env.workflow.update_triage_thresholds(&admin(), invalid).await.is_err());

    let relaxed = TriageThresholds {
        low_threshold: 0.5,
        high_threshold: 0.8,
        min_quality: 0.4,
    };
    env.workflow.update_triage_thresholds(&admin(), relaxed).await.unwrap();
    assert_eq!(env.workflow.triage_thresholds().await, relaxed);

    let second = env.submit(batch.batch_id, StageName::Germination, &["c.jpg", "d.jpg"]).await;
    assert!(second.images.iter().all(|i| !i.record.is_pending()));

    let restored = env.workflow.reset_triage_thresholds(&admin()).await.unwrap();
    assert_eq!(restored, TriageThresholds::default());
}
