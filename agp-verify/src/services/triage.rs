//! Triage of AI scores into an initial record decision
//!
//! `deepfake_score < low` with `visual_quality_score > min_quality` approves
//! automatically, `deepfake_score > high` is recommended for rejection (still
//! pending a human), and everything else, including absent or invalid scores,
//! goes to a human reviewer.

use agp_common::config::TriageConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::settings::get_triage_overrides;
use crate::error::WorkflowError;
use crate::models::{AiAction, AiValidation, Decision, VerificationStatus, SYSTEM_VERIFIER_ID};
use crate::services::ai_validation::AiScore;

/// Reason recorded when scoring produced nothing usable
pub const AI_UNAVAILABLE_REASON: &str = "AI validation unavailable";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriageThresholds {
    pub low_threshold: f64,
    pub high_threshold: f64,
    pub min_quality: f64,
}

impl Default for TriageThresholds {
    fn default() -> Self {
        TriageConfig::default().into()
    }
}

impl From<TriageConfig> for TriageThresholds {
    fn from(config: TriageConfig) -> Self {
        Self {
            low_threshold: config.low_threshold,
            high_threshold: config.high_threshold,
            min_quality: config.min_quality,
        }
    }
}

impl TriageThresholds {
    /// `0 <= low <= high <= 1` and `0 <= min_quality <= 1`
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let in_unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);

        if !in_unit(self.low_threshold) || !in_unit(self.high_threshold) || !in_unit(self.min_quality) {
            return Err(WorkflowError::Validation(
                "Triage thresholds must lie within [0, 1]".to_string(),
            ));
        }
        if self.low_threshold > self.high_threshold {
            return Err(WorkflowError::Validation(format!(
                "low_threshold ({}) must not exceed high_threshold ({})",
                self.low_threshold, self.high_threshold
            )));
        }
        Ok(())
    }

    /// Resolve thresholds: database settings, then configuration, then defaults
    pub async fn resolve(pool: &SqlitePool, config: &TriageConfig) -> Result<Self, WorkflowError> {
        let overrides = get_triage_overrides(pool).await?;
        let thresholds = Self {
            low_threshold: overrides.low_threshold.unwrap_or(config.low_threshold),
            high_threshold: overrides.high_threshold.unwrap_or(config.high_threshold),
            min_quality: overrides.min_quality.unwrap_or(config.min_quality),
        };

        match thresholds.validate() {
            Ok(()) => Ok(thresholds),
            Err(e) => {
                tracing::warn!(error = %e, "Stored triage thresholds invalid, using defaults");
                Ok(Self::default())
            }
        }
    }
}

/// Initial record state produced by triage
#[derive(Debug, Clone, PartialEq)]
pub struct TriageOutcome {
    pub action: AiAction,
    pub decision: Decision,
    /// None when the AI was unavailable or returned non-numeric scores
    pub ai_validation: Option<AiValidation>,
}

#[derive(Debug, Clone, Copy)]
pub struct TriageEngine {
    thresholds: TriageThresholds,
}

impl TriageEngine {
    pub fn new(thresholds: TriageThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> TriageThresholds {
        self.thresholds
    }

    /// Classify a pair of scores
    pub fn classify(&self, deepfake_score: f64, visual_quality_score: f64) -> (AiAction, String) {
        let t = &self.thresholds;
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);

        if !in_unit(deepfake_score) || !in_unit(visual_quality_score) {
            return (
                AiAction::FlagForHuman,
                format!(
                    "Scores out of range (deepfake {:.3}, quality {:.3})",
                    deepfake_score, visual_quality_score
                ),
            );
        }

        if deepfake_score < t.low_threshold && visual_quality_score > t.min_quality {
            (
                AiAction::AutoApprove,
                format!(
                    "Deepfake score {:.3} below {:.2} with quality {:.3}",
                    deepfake_score, t.low_threshold, visual_quality_score
                ),
            )
        } else if deepfake_score > t.high_threshold {
            (
                AiAction::AutoReject,
                format!("Deepfake score {:.3} above {:.2}", deepfake_score, t.high_threshold),
            )
        } else {
            (
                AiAction::FlagForHuman,
                format!(
                    "Inconclusive (deepfake {:.3}, quality {:.3})",
                    deepfake_score, visual_quality_score
                ),
            )
        }
    }

    /// Turn a scoring result (None when the AI failed) into the initial record state
    pub fn evaluate(&self, score: Option<&AiScore>, at: DateTime<Utc>) -> TriageOutcome {
        let score = score.filter(|s| s.deepfake_score.is_finite() && s.visual_quality_score.is_finite());

        let Some(score) = score else {
            return TriageOutcome {
                action: AiAction::FlagForHuman,
                decision: Decision::Unreviewed {
                    ai_action: AiAction::FlagForHuman,
                    flagged: false,
                    flag_note: None,
                },
                ai_validation: None,
            };
        };

        let (action, triage_reason) = self.classify(score.deepfake_score, score.visual_quality_score);
        let ai_reason = match score.reason.as_deref() {
            Some(model_reason) if !model_reason.trim().is_empty() => format!("{}; {}", triage_reason, model_reason),
            _ => triage_reason,
        };

        let decision = match action {
            AiAction::AutoApprove => Decision::Decided {
                status: VerificationStatus::Real,
                reason: None,
                by: SYSTEM_VERIFIER_ID.to_string(),
                at,
            },
            other => Decision::Unreviewed {
                ai_action: other,
                flagged: false,
                flag_note: None,
            },
        };

        TriageOutcome {
            action,
            decision,
            ai_validation: Some(AiValidation {
                deepfake_score: score.deepfake_score,
                visual_quality_score: score.visual_quality_score,
                ai_action: action,
                ai_reason,
                scored_at: at,
            }),
        }
    }
}
