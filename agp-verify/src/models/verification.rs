//! Per-image verification records
//!
//! A record pairs the AI payload with the decision state. The decision is a
//! tagged variant so "pending human confirmation" (including AUTO_REJECT) is
//! explicit instead of hiding behind a nullable status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::actor::SYSTEM_VERIFIER_ID;
use super::stage::StageName;

/// Final authenticity status of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Real,
    Fake,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Real => "REAL",
            VerificationStatus::Fake => "FAKE",
        }
    }
}

impl FromStr for VerificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REAL" => Ok(VerificationStatus::Real),
            "FAKE" => Ok(VerificationStatus::Fake),
            other => Err(format!("Unknown verification status: {}", other)),
        }
    }
}

/// Triage outcome recorded with the AI payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AiAction {
    AutoApprove,
    AutoReject,
    FlagForHuman,
}

impl AiAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiAction::AutoApprove => "AUTO_APPROVE",
            AiAction::AutoReject => "AUTO_REJECT",
            AiAction::FlagForHuman => "FLAG_FOR_HUMAN",
        }
    }
}

impl FromStr for AiAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTO_APPROVE" => Ok(AiAction::AutoApprove),
            "AUTO_REJECT" => Ok(AiAction::AutoReject),
            "FLAG_FOR_HUMAN" => Ok(AiAction::FlagForHuman),
            other => Err(format!("Unknown AI action: {}", other)),
        }
    }
}

/// Scoring payload attached to a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiValidation {
    /// Higher means more likely synthetic (0..=1)
    pub deepfake_score: f64,
    /// 0..=1
    pub visual_quality_score: f64,
    pub ai_action: AiAction,
    pub ai_reason: String,
    pub scored_at: DateTime<Utc>,
}

/// Decision state of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// No final status yet. `ai_action` is FLAG_FOR_HUMAN when the AI was unavailable.
    Unreviewed {
        ai_action: AiAction,
        /// Set when an admin explicitly pushed the record back for review
        flagged: bool,
        flag_note: Option<String>,
    },
    /// Final status set by an admin, or by triage for AUTO_APPROVE
    Decided {
        status: VerificationStatus,
        reason: Option<String>,
        by: String,
        at: DateTime<Utc>,
    },
}

/// Identity of a verification record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub batch_id: Uuid,
    pub stage: StageName,
    pub image_url: String,
}

impl RecordKey {
    pub fn new(batch_id: Uuid, stage: StageName, image_url: impl Into<String>) -> Self {
        Self {
            batch_id,
            stage,
            image_url: image_url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    #[serde(flatten)]
    pub key: RecordKey,
    pub farmer_id: String,
    pub decision: Decision,
    /// None when the AI service was unavailable
    pub ai_validation: Option<AiValidation>,
    /// Bumped on every write
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VerificationRecord {
    /// REAL / FAKE, or None while pending
    pub fn verification_status(&self) -> Option<VerificationStatus> {
        match &self.decision {
            Decision::Decided { status, .. } => Some(*status),
            Decision::Unreviewed { .. } => None,
        }
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        match &self.decision {
            Decision::Decided { reason, .. } => reason.as_deref(),
            Decision::Unreviewed { .. } => None,
        }
    }

    pub fn verified_by(&self) -> Option<&str> {
        match &self.decision {
            Decision::Decided { by, .. } => Some(by.as_str()),
            Decision::Unreviewed { .. } => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.decision, Decision::Unreviewed { .. })
    }

    /// True for an automatic approval written by triage
    pub fn is_system_decision(&self) -> bool {
        self.verified_by() == Some(SYSTEM_VERIFIER_ID)
    }

    /// Pending and the AI recommended rejection
    pub fn awaits_rejection_confirmation(&self) -> bool {
        matches!(
            self.decision,
            Decision::Unreviewed {
                ai_action: AiAction::AutoReject,
                ..
            }
        )
    }
}
