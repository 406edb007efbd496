//! Batch (crop lot) model

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::WorkflowError;

/// Coarse, farmer-and-admin-visible batch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Verified,
    Rejected,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Verified => "VERIFIED",
            BatchStatus::Rejected => "REJECTED",
        }
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(BatchStatus::Pending),
            "VERIFIED" => Ok(BatchStatus::Verified),
            "REJECTED" => Ok(BatchStatus::Rejected),
            other => Err(format!("Unknown batch status: {}", other)),
        }
    }
}

/// Descriptive fields supplied by the farmer at creation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchDetails {
    pub crop_name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub area: Option<f64>,
    #[serde(default)]
    pub area_unit: Option<String>,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub quantity_unit: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub sowing_date: Option<NaiveDate>,
    #[serde(default)]
    pub planting_date: Option<NaiveDate>,
    #[serde(default)]
    pub expected_harvest_date: Option<NaiveDate>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fertilizer_notes: Option<String>,
    #[serde(default)]
    pub pesticide_notes: Option<String>,
}

impl BatchDetails {
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.crop_name.trim().is_empty() {
            return Err(WorkflowError::Validation("Crop name is required".to_string()));
        }

        for (field, value) in [("area", self.area), ("quantity", self.quantity)] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(WorkflowError::Validation(format!(
                        "{} must be a non-negative number",
                        field
                    )));
                }
            }
        }

        if let (Some(sown), Some(harvest)) = (self.sowing_date, self.expected_harvest_date) {
            if harvest < sown {
                return Err(WorkflowError::Validation(
                    "Expected harvest date precedes sowing date".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Issued certificate as exposed on a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub certificate_id: String,
    pub qr_payload: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub batch_code: String,
    pub farmer_id: String,
    #[serde(flatten)]
    pub details: BatchDetails,
    pub status: BatchStatus,
    /// Admin reason for the latest rejection
    pub rejection_reason: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verified_by: Option<String>,
    /// Present only while VERIFIED with an unrevoked certificate
    pub certificate: Option<CertificateInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Human-readable batch code: `AGP-YYYYMMDD-XXXXXX`
pub fn generate_batch_code(created_at: DateTime<Utc>, batch_id: Uuid) -> String {
    let simple = batch_id.simple().to_string().to_ascii_uppercase();
    format!("AGP-{}-{}", created_at.format("%Y%m%d"), &simple[..6])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_batch_code_format() {
        let created = Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap();
        let id = Uuid::parse_str("3f2a9c10-0000-4000-8000-000000000000").unwrap();
        assert_eq!(generate_batch_code(created, id), "AGP-20260314-3F2A9C");
    }

    #[test]
    fn test_details_validation() {
        let mut details = BatchDetails {
            crop_name: "Basmati Rice".to_string(),
            area: Some(2.5),
            ..Default::default()
        };
        assert!(details.validate().is_ok());

        details.quantity = Some(-1.0);
        assert!(details.validate().is_err());

        details.quantity = None;
        details.sowing_date = NaiveDate::from_ymd_opt(2026, 6, 1);
        details.expected_harvest_date = NaiveDate::from_ymd_opt(2026, 5, 1);
        assert!(details.validate().is_err());

        let blank = BatchDetails {
            crop_name: "  ".to_string(),
            ..Default::default()
        };
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_status_parse_case_insensitive() {
        assert_eq!("verified".parse::<BatchStatus>().unwrap(), BatchStatus::Verified);
        assert!("archived".parse::<BatchStatus>().is_err());
    }
}
