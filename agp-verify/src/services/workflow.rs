//! Workflow facade wiring the services to one database, event bus and set of
//! external collaborators

use agp_common::config::{LimitsConfig, ServicesConfig, TriageConfig};
use agp_common::events::EventBus;
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

use super::ai_validation::{AiValidator, HttpAiValidator, UnavailableAiValidator};
use super::appeal_manager::AppealManager;
use super::batch_lifecycle::BatchLifecycle;
use super::certificate_gate::CertificateGate;
use super::certificate_issuer::{CertificateIssuer, HttpCertificateIssuer, LocalCertificateIssuer};
use super::image_store::{HttpImageStore, ImageStore, LocalImageStore};
use super::moderation::Moderation;
use super::notifier::{EventBusNotifier, ReviewerNotifier};
use super::stage_tracker::StageTracker;
use super::triage::{TriageEngine, TriageThresholds};
use crate::db::settings;
use crate::error::WorkflowResult;
use crate::models::Actor;

/// External services the workflow talks to
#[derive(Clone)]
pub struct Collaborators {
    pub image_store: Arc<dyn ImageStore>,
    pub ai_validator: Arc<dyn AiValidator>,
    pub certificate_issuer: Arc<dyn CertificateIssuer>,
    pub notifier: Arc<dyn ReviewerNotifier>,
}

impl Collaborators {
    /// HTTP adapters for configured endpoints, local adapters for the rest
    pub fn from_config(
        services: &ServicesConfig,
        limits: &LimitsConfig,
        images_dir: &Path,
        event_bus: EventBus,
    ) -> agp_common::Result<Self> {
        let config_err = |what: &str, e: String| agp_common::Error::Config(format!("{}: {}", what, e));

        let image_store: Arc<dyn ImageStore> = match &services.image_store_url {
            Some(url) => {
                info!(url = %url, "Using HTTP image store");
                Arc::new(
                    HttpImageStore::new(url.as_str(), Duration::from_millis(limits.upload_timeout_ms))
                        .map_err(|e| config_err("image store", e.to_string()))?,
                )
            }
            None => {
                info!(dir = %images_dir.display(), "Using local image store");
                Arc::new(LocalImageStore::new(images_dir))
            }
        };

        let ai_validator: Arc<dyn AiValidator> = match &services.ai_validation_url {
            Some(url) => {
                info!(url = %url, "Using HTTP AI validation service");
                Arc::new(
                    HttpAiValidator::new(url.as_str(), Duration::from_millis(limits.ai_timeout_ms))
                        .map_err(|e| config_err("AI validation", e.to_string()))?,
                )
            }
            None => {
                info!("No AI validation service configured; every image goes to human review");
                Arc::new(UnavailableAiValidator)
            }
        };

        let certificate_issuer: Arc<dyn CertificateIssuer> = match &services.certificate_issuer_url {
            Some(url) => {
                info!(url = %url, "Using HTTP certificate issuer");
                Arc::new(
                    HttpCertificateIssuer::new(url.as_str(), Duration::from_millis(limits.issuer_timeout_ms))
                        .map_err(|e| config_err("certificate issuer", e.to_string()))?,
                )
            }
            None => {
                info!("Using local certificate issuer");
                Arc::new(LocalCertificateIssuer)
            }
        };

        Ok(Self {
            image_store,
            ai_validator,
            certificate_issuer,
            notifier: Arc::new(EventBusNotifier::new(event_bus)),
        })
    }
}

/// Concurrency cap and timeouts for external calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowLimits {
    pub max_concurrent_scoring: usize,
    pub ai_timeout: Duration,
    pub upload_timeout: Duration,
    pub upload_retries: u32,
    pub issuer_timeout: Duration,
}

impl From<&LimitsConfig> for WorkflowLimits {
    fn from(config: &LimitsConfig) -> Self {
        Self {
            max_concurrent_scoring: config.max_concurrent_scoring.max(1),
            ai_timeout: Duration::from_millis(config.ai_timeout_ms),
            upload_timeout: Duration::from_millis(config.upload_timeout_ms),
            upload_retries: config.upload_retries,
            issuer_timeout: Duration::from_millis(config.issuer_timeout_ms),
        }
    }
}

impl Default for WorkflowLimits {
    fn default() -> Self {
        (&LimitsConfig::default()).into()
    }
}

#[derive(Clone)]
pub struct Workflow {
    pub batches: BatchLifecycle,
    pub stages: StageTracker,
    pub moderation: Moderation,
    pub appeals: AppealManager,
    pub certificates: CertificateGate,
    db: SqlitePool,
    triage: Arc<RwLock<TriageEngine>>,
    triage_config: TriageConfig,
}

impl Workflow {
    pub async fn new(
        db: SqlitePool,
        event_bus: EventBus,
        collaborators: Collaborators,
        limits: WorkflowLimits,
        triage_config: TriageConfig,
    ) -> WorkflowResult<Self> {
        let thresholds = TriageThresholds::resolve(&db, &triage_config).await?;
        info!(
            low = thresholds.low_threshold,
            high = thresholds.high_threshold,
            min_quality = thresholds.min_quality,
            "Triage thresholds loaded"
        );
        let triage = Arc::new(RwLock::new(TriageEngine::new(thresholds)));

        let gate = CertificateGate::new(
            db.clone(),
            collaborators.certificate_issuer,
            event_bus.clone(),
            limits.issuer_timeout,
        );

        Ok(Self {
            batches: BatchLifecycle::new(db.clone(), event_bus.clone(), gate.clone()),
            stages: StageTracker::new(
                db.clone(),
                event_bus.clone(),
                collaborators.image_store,
                collaborators.ai_validator,
                Arc::clone(&triage),
                gate.clone(),
                limits,
            ),
            moderation: Moderation::new(db.clone(), event_bus.clone(), gate.clone()),
            appeals: AppealManager::new(db.clone(), event_bus, collaborators.notifier, gate.clone()),
            certificates: gate,
            db,
            triage,
            triage_config,
        })
    }

    /// Thresholds applied to new submissions
    pub async fn triage_thresholds(&self) -> TriageThresholds {
        self.triage.read().await.thresholds()
    }

    /// Persist new thresholds and apply them to subsequent submissions
    pub async fn update_triage_thresholds(
        &self,
        actor: &Actor,
        thresholds: TriageThresholds,
    ) -> WorkflowResult<TriageThresholds> {
        let admin_id = actor.require_admin()?;
        thresholds.validate()?;

        let mut engine = self.triage.write().await;
        settings::set_triage_thresholds(
            &self.db,
            thresholds.low_threshold,
            thresholds.high_threshold,
            thresholds.min_quality,
        )
        .await?;
        *engine = TriageEngine::new(thresholds);

        info!(
            low = thresholds.low_threshold,
            high = thresholds.high_threshold,
            min_quality = thresholds.min_quality,
            actor = admin_id,
            "Triage thresholds updated"
        );
        Ok(thresholds)
    }

    /// Drop stored overrides and fall back to configuration
    pub async fn reset_triage_thresholds(&self, actor: &Actor) -> WorkflowResult<TriageThresholds> {
        let admin_id = actor.require_admin()?;

        let mut engine = self.triage.write().await;
        settings::clear_triage_overrides(&self.db).await?;
        let thresholds = TriageThresholds::resolve(&self.db, &self.triage_config).await?;
        *engine = TriageEngine::new(thresholds);

        info!(actor = admin_id, "Triage thresholds reset to configuration");
        Ok(thresholds)
    }
}
