//! Cultivation stages
//!
//! A batch moves through seven fixed, ordered stages. `(batch_id, stage_name)`
//! is the identity callers reason about; `stage_id` only exists once the stage
//! has been persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Minimum persisted images before a stage counts as submitted
pub const MIN_STAGE_IMAGES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageName {
    LandPreparation,
    Sowing,
    Germination,
    VegetativeGrowth,
    Flowering,
    Harvesting,
    PostHarvest,
}

impl StageName {
    /// All stages in cultivation order
    pub const ALL: [StageName; 7] = [
        StageName::LandPreparation,
        StageName::Sowing,
        StageName::Germination,
        StageName::VegetativeGrowth,
        StageName::Flowering,
        StageName::Harvesting,
        StageName::PostHarvest,
    ];

    /// Wire/storage form (`LAND_PREPARATION`)
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::LandPreparation => "LAND_PREPARATION",
            StageName::Sowing => "SOWING",
            StageName::Germination => "GERMINATION",
            StageName::VegetativeGrowth => "VEGETATIVE_GROWTH",
            StageName::Flowering => "FLOWERING",
            StageName::Harvesting => "HARVESTING",
            StageName::PostHarvest => "POST_HARVEST",
        }
    }

    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            StageName::LandPreparation => "Land Preparation",
            StageName::Sowing => "Sowing",
            StageName::Germination => "Germination",
            StageName::VegetativeGrowth => "Vegetative Growth",
            StageName::Flowering => "Flowering",
            StageName::Harvesting => "Harvesting",
            StageName::PostHarvest => "Post-Harvest",
        }
    }

    /// 1-based position in the cultivation sequence
    pub fn order(&self) -> i64 {
        match self {
            StageName::LandPreparation => 1,
            StageName::Sowing => 2,
            StageName::Germination => 3,
            StageName::VegetativeGrowth => 4,
            StageName::Flowering => 5,
            StageName::Harvesting => 6,
            StageName::PostHarvest => 7,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    /// Accepts the wire form, the label, and kebab/lower-case variants
    /// (`SOWING`, `Sowing`, `post-harvest`, `Land Preparation`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();

        StageName::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| format!("Unknown stage: {}", s))
    }
}

/// Farmer-reported progress of a stage (not derived from verification)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "PENDING",
            StageStatus::InProgress => "IN_PROGRESS",
            StageStatus::Completed => "COMPLETED",
        }
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StageStatus::Pending),
            "IN_PROGRESS" => Ok(StageStatus::InProgress),
            "COMPLETED" => Ok(StageStatus::Completed),
            other => Err(format!("Unknown stage status: {}", other)),
        }
    }
}

/// Persisted stage of a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Storage surrogate; never used as an external key
    pub stage_id: Uuid,
    pub batch_id: Uuid,
    pub stage_name: StageName,
    pub status: StageStatus,
    /// Farmer-supplied order, appended on re-submission
    pub image_urls: Vec<String>,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Stage {
    pub fn is_submitted(&self) -> bool {
        self.image_urls.len() >= MIN_STAGE_IMAGES
    }
}
