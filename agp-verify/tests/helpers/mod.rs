//! Shared fixtures for agp-verify integration tests
//!
//! Scripted stand-ins for the external collaborators plus a fully wired
//! workflow over an in-memory database.

#![allow(dead_code)]

use agp_common::config::TriageConfig;
use agp_common::db::connect_in_memory;
use agp_common::events::EventBus;
use agp_verify::models::{Actor, Appeal, Batch, BatchDetails, RecordKey, StageName, VerificationStatus};
use agp_verify::services::{
    AiScore, AiValidationError, AiValidator, CertificateIssuer, CertificateRequest, Collaborators, ImageStore,
    ImageUpload, IssuedCertificate, IssuerError, ReviewerNotifier, ScoringContext, StageResult, StageSubmission,
    StorageError, UploadContext, Workflow, WorkflowLimits,
};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const FARMER: &str = "farmer-1";
pub const OTHER_FARMER: &str = "farmer-2";
pub const ADMIN: &str = "admin-1";

pub fn farmer() -> Actor {
    Actor::farmer(FARMER).unwrap()
}

pub fn other_farmer() -> Actor {
    Actor::farmer(OTHER_FARMER).unwrap()
}

pub fn admin() -> Actor {
    Actor::admin(ADMIN).unwrap()
}

// ============================================================================
// Image store
// ============================================================================

/// In-memory image store; URLs end with the submitted file name
#[derive(Default)]
pub struct MemoryImageStore {
    stored: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    attempts: AtomicUsize,
}

impl MemoryImageStore {
    /// Every upload of `file_name` fails from now on
    pub fn fail_file(&self, file_name: &str) {
        self.failing.lock().unwrap().insert(file_name.to_string());
    }

    /// Every upload of `file_name` stalls until the caller gives up
    pub fn hang_file(&self, file_name: &str) {
        self.hanging.lock().unwrap().insert(file_name.to_string());
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> Vec<String> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn upload_image(&self, image: &ImageUpload, context: &UploadContext) -> Result<String, StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(&image.file_name) {
            return Err(StorageError::Rejected(503, "injected failure".to_string()));
        }
        let hangs = self.hanging.lock().unwrap().contains(&image.file_name);
        if hangs {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let url = format!(
            "mem://{}/{}/{}/{}",
            context.batch_id,
            context.stage,
            Uuid::new_v4().simple(),
            image.file_name
        );
        self.stored.lock().unwrap().push(url.clone());
        Ok(url)
    }
}

// ============================================================================
// AI validator
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub enum Script {
    Score { deepfake: f64, quality: f64 },
    Fail,
    /// Never answers; exercises the scoring timeout
    Hang,
}

/// AI validator answering per file name, with a default for everything else
pub struct ScriptedAiValidator {
    scripts: Mutex<HashMap<String, Script>>,
    default: Mutex<Script>,
    calls: AtomicUsize,
    latency_ms: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Counts one scoring call as in flight until dropped, timeouts included
struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for ScriptedAiValidator {
    fn default() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default: Mutex::new(Script::Score {
                deepfake: 0.5,
                quality: 0.9,
            }),
            calls: AtomicUsize::new(0),
            latency_ms: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }
}

impl ScriptedAiValidator {
    pub fn script(&self, file_name: &str, script: Script) {
        self.scripts.lock().unwrap().insert(file_name.to_string(), script);
    }

    pub fn set_default(&self, script: Script) {
        *self.default.lock().unwrap() = script;
    }

    /// Drop per-file scripts so the default applies everywhere
    pub fn clear_scripts(&self) {
        self.scripts.lock().unwrap().clear();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every answer takes at least this long
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as usize, Ordering::SeqCst);
    }

    /// Most scoring calls ever running at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn script_for(&self, image_url: &str) -> Script {
        let scripts = self.scripts.lock().unwrap();
        scripts
            .iter()
            .find(|(name, _)| image_url.ends_with(&format!("/{}", name)))
            .map(|(_, script)| *script)
            .unwrap_or(*self.default.lock().unwrap())
    }
}

#[async_trait]
impl AiValidator for ScriptedAiValidator {
    async fn score_image(&self, image_url: &str, _context: &ScoringContext) -> Result<AiScore, AiValidationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.in_flight, &self.peak_in_flight);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency as u64)).await;
        }

        match self.script_for(image_url) {
            Script::Score { deepfake, quality } => Ok(AiScore {
                deepfake_score: deepfake,
                visual_quality_score: quality,
                reason: Some("scripted".to_string()),
            }),
            Script::Fail => Err(AiValidationError::ApiError(500, "scripted failure".to_string())),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(AiValidationError::Timeout(Duration::from_secs(3600)))
            }
        }
    }
}

// ============================================================================
// Certificate issuer
// ============================================================================

/// Issuer counting every call, with optional failure and latency
#[derive(Default)]
pub struct CountingIssuer {
    calls: AtomicUsize,
    issued: AtomicUsize,
    failing: AtomicBool,
    delay_ms: AtomicUsize,
}

impl CountingIssuer {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateIssuer for CountingIssuer {
    async fn issue_certificate(&self, request: &CertificateRequest) -> Result<IssuedCertificate, IssuerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(IssuerError::ApiError(503, "ledger unavailable".to_string()));
        }

        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(IssuedCertificate {
            certificate_id: format!("CERT-{}-{}", request.batch_code, call),
            qr_payload: format!("qr://{}", request.batch_code),
        })
    }
}

// ============================================================================
// Reviewer notifier
// ============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    appeals: Mutex<Vec<Uuid>>,
}

impl RecordingNotifier {
    pub fn notified(&self) -> Vec<Uuid> {
        self.appeals.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReviewerNotifier for RecordingNotifier {
    async fn appeal_filed(&self, appeal: &Appeal) {
        self.appeals.lock().unwrap().push(appeal.appeal_id);
    }
}

// ============================================================================
// Wired environment
// ============================================================================

pub struct TestEnv {
    pub pool: SqlitePool,
    pub event_bus: EventBus,
    pub workflow: Workflow,
    pub store: Arc<MemoryImageStore>,
    pub ai: Arc<ScriptedAiValidator>,
    pub issuer: Arc<CountingIssuer>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn test_limits() -> WorkflowLimits {
    WorkflowLimits {
        max_concurrent_scoring: 4,
        ai_timeout: Duration::from_millis(200),
        upload_timeout: Duration::from_millis(200),
        upload_retries: 1,
        issuer_timeout: Duration::from_millis(500),
    }
}

/// Workflow over a fresh in-memory database
pub async fn setup() -> TestEnv {
    setup_with_pool(connect_in_memory().await.unwrap()).await
}

pub async fn setup_with_pool(pool: SqlitePool) -> TestEnv {
    let event_bus = EventBus::new(256);
    let store = Arc::new(MemoryImageStore::default());
    let ai = Arc::new(ScriptedAiValidator::default());
    let issuer = Arc::new(CountingIssuer::default());
    let notifier = Arc::new(RecordingNotifier::default());

    let collaborators = Collaborators {
        image_store: store.clone(),
        ai_validator: ai.clone(),
        certificate_issuer: issuer.clone(),
        notifier: notifier.clone(),
    };

    let workflow = Workflow::new(
        pool.clone(),
        event_bus.clone(),
        collaborators,
        test_limits(),
        TriageConfig::default(),
    )
    .await
    .unwrap();

    TestEnv {
        pool,
        event_bus,
        workflow,
        store,
        ai,
        issuer,
        notifier,
    }
}

pub fn images(names: &[&str]) -> Vec<ImageUpload> {
    names
        .iter()
        .map(|name| ImageUpload {
            file_name: name.to_string(),
            content_type: Some("image/jpeg".to_string()),
            bytes: vec![0xFF, 0xD8, 0xFF, 0xE0, name.len() as u8],
        })
        .collect()
}

pub fn wheat() -> BatchDetails {
    BatchDetails {
        crop_name: "Wheat".to_string(),
        category: Some("Cereal".to_string()),
        area: Some(2.5),
        area_unit: Some("acre".to_string()),
        location: Some("Nashik".to_string()),
        ..Default::default()
    }
}

impl TestEnv {
    pub async fn create_batch(&self) -> Batch {
        self.workflow.batches.create_batch(&farmer(), wheat()).await.unwrap()
    }

    pub async fn submit(&self, batch_id: Uuid, stage: StageName, names: &[&str]) -> StageResult {
        self.try_submit(batch_id, stage, names).await.unwrap()
    }

    pub async fn try_submit(
        &self,
        batch_id: Uuid,
        stage: StageName,
        names: &[&str],
    ) -> agp_verify::error::WorkflowResult<StageResult> {
        self.workflow
            .stages
            .submit_stage(
                &farmer(),
                StageSubmission {
                    batch_id,
                    stage,
                    images: images(names),
                    notes: None,
                    status: None,
                },
            )
            .await
    }

    /// Submit two images to every stage
    pub async fn complete_all_stages(&self, batch_id: Uuid) {
        for stage in StageName::ALL {
            let a = format!("{}-a.jpg", stage.as_str().to_ascii_lowercase());
            let b = format!("{}-b.jpg", stage.as_str().to_ascii_lowercase());
            self.submit(batch_id, stage, &[&a, &b]).await;
        }
    }

    /// Admin marks one record FAKE
    pub async fn mark_fake(&self, key: &RecordKey) {
        self.workflow
            .moderation
            .decide(&admin(), key, VerificationStatus::Fake, Some("Image looks generated"), None)
            .await
            .unwrap();
    }
}

pub fn key_of(result: &StageResult, index: usize) -> RecordKey {
    result.images[index].record.key.clone()
}
