//! Batch progress summary
//!
//! Derived view over stages and verification records; nothing here is stored.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::batch::{BatchStatus, CertificateInfo};
use super::stage::{StageName, StageStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: StageName,
    /// None until the stage has been persisted
    pub status: Option<StageStatus>,
    pub submitted: bool,
    pub image_count: usize,
    pub real: usize,
    pub fake: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    /// All seven stages in cultivation order
    pub stages: Vec<StageProgress>,
    pub missing_stages: Vec<StageName>,
    pub pending_images: usize,
    pub fake_images: usize,
    /// Every gate condition except "no certificate yet" holds
    pub certificate_eligible: bool,
    pub certificate: Option<CertificateInfo>,
}
