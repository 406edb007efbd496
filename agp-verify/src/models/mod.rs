//! Data models for agp-verify
//!
//! - Batch lifecycle status and descriptive fields
//! - Seven fixed cultivation stages
//! - Per-image verification records with a tagged decision state
//! - Appeals and derived progress summaries

pub mod actor;
pub mod appeal;
pub mod batch;
pub mod progress;
pub mod stage;
pub mod verification;

pub use actor::{Actor, SYSTEM_VERIFIER_ID};
pub use appeal::{Appeal, AppealResolution, AppealStatus};
pub use batch::{generate_batch_code, Batch, BatchDetails, BatchStatus, CertificateInfo};
pub use progress::{BatchProgress, StageProgress};
pub use stage::{Stage, StageName, StageStatus, MIN_STAGE_IMAGES};
pub use verification::{AiAction, AiValidation, Decision, RecordKey, VerificationRecord, VerificationStatus};
