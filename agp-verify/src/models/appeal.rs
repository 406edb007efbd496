//! Farmer appeals against FAKE decisions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::stage::StageName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppealStatus {
    Open,
    Resolved,
}

impl AppealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppealStatus::Open => "OPEN",
            AppealStatus::Resolved => "RESOLVED",
        }
    }
}

impl FromStr for AppealStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(AppealStatus::Open),
            "RESOLVED" => Ok(AppealStatus::Resolved),
            other => Err(format!("Unknown appeal status: {}", other)),
        }
    }
}

/// How an admin closed an appeal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppealResolution {
    /// Record returns to pending for a fresh review
    ResetToPending,
    /// Record becomes REAL
    ApprovedAsReal,
    /// FAKE decision stands
    RejectionUpheld,
}

impl AppealResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppealResolution::ResetToPending => "RESET_TO_PENDING",
            AppealResolution::ApprovedAsReal => "APPROVED_AS_REAL",
            AppealResolution::RejectionUpheld => "REJECTION_UPHELD",
        }
    }
}

impl FromStr for AppealResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RESET_TO_PENDING" => Ok(AppealResolution::ResetToPending),
            "APPROVED_AS_REAL" => Ok(AppealResolution::ApprovedAsReal),
            "REJECTION_UPHELD" => Ok(AppealResolution::RejectionUpheld),
            other => Err(format!("Unknown appeal resolution: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appeal {
    pub appeal_id: Uuid,
    pub batch_id: Uuid,
    pub stage: StageName,
    pub image_url: String,
    pub farmer_id: String,
    pub reason: String,
    pub status: AppealStatus,
    pub resolution: Option<AppealResolution>,
    pub resolved_by: Option<String>,
    pub resolution_note: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appeal {
    pub fn is_open(&self) -> bool {
        self.status == AppealStatus::Open
    }
}
