//! Verification record database operations
//!
//! Every write is a single conditional UPDATE that bumps `version` and
//! returns the new row, so concurrent admin actions on one record serialize
//! in SQLite and resolve last-write-wins. Callers that pass an expected
//! version get a stale-version outcome instead of overwriting.

use agp_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqliteExecutor, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;

use super::{parse_column, parse_optional_timestamp, parse_timestamp, parse_uuid, ATTACHED_TO_STAGE};
use crate::models::{
    AiAction, AiValidation, Decision, RecordKey, StageName, VerificationRecord, VerificationStatus,
    SYSTEM_VERIFIER_ID,
};

const RECORD_COLUMNS: &str = r#"
    v.batch_id, v.stage_name, v.image_url, v.farmer_id,
    v.verification_status, v.rejection_reason, v.verified_by, v.decided_at,
    v.flagged, v.flag_note,
    v.deepfake_score, v.visual_quality_score, v.ai_action, v.ai_reason, v.scored_at,
    v.version, v.created_at, v.updated_at
"#;

/// Admin or appeal-driven change to a record's decision
#[derive(Debug, Clone, PartialEq)]
pub enum RecordUpdate {
    /// Set a final status
    Decide {
        status: VerificationStatus,
        reason: Option<String>,
        by: String,
    },
    /// Back to pending with a review note
    Flag { note: Option<String> },
    /// Back to pending, clearing status and reason
    Reset,
}

/// Result of a versioned write
#[derive(Debug, Clone, PartialEq)]
pub enum RecordWrite {
    Written(VerificationRecord),
    Missing,
    Stale { actual: i64 },
}

/// Real / fake / pending counts for one stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionCounts {
    pub real: usize,
    pub fake: usize,
    pub pending: usize,
}

/// Insert a freshly triaged record; existing records are left untouched
///
/// Returns false when a record for the same key already existed.
pub async fn insert_if_absent(conn: &mut SqliteConnection, record: &VerificationRecord) -> Result<bool> {
    let (status, reason, verified_by, decided_at, flagged, flag_note, decision_action) = match &record.decision {
        Decision::Decided { status, reason, by, at } => (
            Some(status.as_str()),
            reason.clone(),
            Some(by.clone()),
            Some(at.to_rfc3339()),
            false,
            None,
            None,
        ),
        Decision::Unreviewed {
            ai_action,
            flagged,
            flag_note,
        } => (None, None, None, None, *flagged, flag_note.clone(), Some(*ai_action)),
    };

    let ai = record.ai_validation.as_ref();
    let ai_action = ai.map(|a| a.ai_action).or(decision_action);

    let result = sqlx::query(
        r#"
        INSERT INTO verification_records (
            batch_id, stage_name, image_url, farmer_id,
            verification_status, rejection_reason, verified_by, decided_at,
            flagged, flag_note,
            deepfake_score, visual_quality_score, ai_action, ai_reason, scored_at,
            version, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(batch_id, stage_name, image_url) DO NOTHING
        "#,
    )
    .bind(record.key.batch_id.to_string())
    .bind(record.key.stage.as_str())
    .bind(&record.key.image_url)
    .bind(&record.farmer_id)
    .bind(status)
    .bind(reason)
    .bind(verified_by)
    .bind(decided_at)
    .bind(flagged)
    .bind(flag_note)
    .bind(ai.map(|a| a.deepfake_score))
    .bind(ai.map(|a| a.visual_quality_score))
    .bind(ai_action.map(|a| a.as_str()))
    .bind(ai.map(|a| a.ai_reason.clone()))
    .bind(ai.map(|a| a.scored_at.to_rfc3339()))
    .bind(record.version)
    .bind(record.created_at.to_rfc3339())
    .bind(record.updated_at.to_rfc3339())
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Load one record, from the pool or inside an open transaction
pub async fn get_record<'e, E>(executor: E, key: &RecordKey) -> Result<Option<VerificationRecord>>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query(&format!(
        "SELECT {} FROM verification_records v WHERE v.batch_id = ? AND v.stage_name = ? AND v.image_url = ?",
        RECORD_COLUMNS
    ))
    .bind(key.batch_id.to_string())
    .bind(key.stage.as_str())
    .bind(&key.image_url)
    .fetch_optional(executor)
    .await?;

    row.map(|r| map_record(&r)).transpose()
}

/// Every record of a batch, including images not (yet) on a stage
pub async fn list_for_batch(pool: &SqlitePool, batch_id: Uuid) -> Result<Vec<VerificationRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM verification_records v WHERE v.batch_id = ? ORDER BY v.created_at, v.image_url",
        RECORD_COLUMNS
    ))
    .bind(batch_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(map_record).collect()
}

/// Records of a batch that never received an AI payload
pub async fn list_unscored(pool: &SqlitePool, batch_id: Uuid) -> Result<Vec<VerificationRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM verification_records v
         WHERE v.batch_id = ? AND v.deepfake_score IS NULL
         ORDER BY v.created_at, v.image_url",
        RECORD_COLUMNS
    ))
    .bind(batch_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(map_record).collect()
}

/// Pending records awaiting a human, AUTO_REJECT first, oldest first
pub async fn review_queue(pool: &SqlitePool, batch_id: Option<Uuid>, limit: i64) -> Result<Vec<VerificationRecord>> {
    let batch_id = batch_id.map(|id| id.to_string());

    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM verification_records v
        WHERE v.verification_status IS NULL
          AND (? IS NULL OR v.batch_id = ?)
          AND {}
        ORDER BY CASE v.ai_action
                     WHEN 'AUTO_REJECT' THEN 0
                     WHEN 'FLAG_FOR_HUMAN' THEN 1
                     ELSE 2
                 END,
                 v.flagged DESC,
                 v.created_at,
                 v.image_url
        LIMIT ?
        "#,
        RECORD_COLUMNS, ATTACHED_TO_STAGE
    ))
    .bind(&batch_id)
    .bind(&batch_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(map_record).collect()
}

/// Decision counts per stage, over images that are on the stage
pub async fn stage_counts(pool: &SqlitePool, batch_id: Uuid) -> Result<HashMap<StageName, DecisionCounts>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT v.stage_name,
               SUM(CASE WHEN v.verification_status = 'REAL' THEN 1 ELSE 0 END) AS real_count,
               SUM(CASE WHEN v.verification_status = 'FAKE' THEN 1 ELSE 0 END) AS fake_count,
               SUM(CASE WHEN v.verification_status IS NULL THEN 1 ELSE 0 END) AS pending_count
        FROM verification_records v
        WHERE v.batch_id = ? AND {}
        GROUP BY v.stage_name
        "#,
        ATTACHED_TO_STAGE
    ))
    .bind(batch_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut counts = HashMap::new();
    for row in rows {
        let stage: String = row.get("stage_name");
        let real: i64 = row.get("real_count");
        let fake: i64 = row.get("fake_count");
        let pending: i64 = row.get("pending_count");
        counts.insert(
            parse_column::<StageName>("stage_name", &stage)?,
            DecisionCounts {
                real: real as usize,
                fake: fake as usize,
                pending: pending as usize,
            },
        );
    }

    Ok(counts)
}

/// Apply an admin change, optionally guarded by the caller's last-seen version
pub async fn update_record(
    conn: &mut SqliteConnection,
    key: &RecordKey,
    update: &RecordUpdate,
    expected_version: Option<i64>,
    at: DateTime<Utc>,
) -> Result<RecordWrite> {
    let at = at.to_rfc3339();

    let (status, reason, by, decided_at, flagged, flag_note) = match update {
        RecordUpdate::Decide { status, reason, by } => (
            Some(status.as_str()),
            reason.clone(),
            Some(by.clone()),
            Some(at.clone()),
            false,
            None,
        ),
        RecordUpdate::Flag { note } => (None, None, None, None, true, note.clone()),
        RecordUpdate::Reset => (None, None, None, None, false, None),
    };

    let row = sqlx::query(
        r#"
        UPDATE verification_records
        SET verification_status = ?, rejection_reason = ?, verified_by = ?, decided_at = ?,
            flagged = ?, flag_note = ?,
            version = version + 1, updated_at = ?
        WHERE batch_id = ? AND stage_name = ? AND image_url = ?
          AND (? IS NULL OR version = ?)
        RETURNING *
        "#,
    )
    .bind(status)
    .bind(reason)
    .bind(by)
    .bind(decided_at)
    .bind(flagged)
    .bind(flag_note)
    .bind(&at)
    .bind(key.batch_id.to_string())
    .bind(key.stage.as_str())
    .bind(&key.image_url)
    .bind(expected_version)
    .bind(expected_version)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = row {
        return Ok(RecordWrite::Written(map_record(&row)?));
    }

    let actual: Option<i64> = sqlx::query_scalar(
        "SELECT version FROM verification_records WHERE batch_id = ? AND stage_name = ? AND image_url = ?",
    )
    .bind(key.batch_id.to_string())
    .bind(key.stage.as_str())
    .bind(&key.image_url)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(match actual {
        Some(actual) => RecordWrite::Stale { actual },
        None => RecordWrite::Missing,
    })
}

/// Attach a late AI payload to a record that has none
///
/// A still-pending, unflagged record takes the new triage outcome: an
/// AUTO_APPROVE becomes REAL by the system verifier. Human decisions are
/// never overwritten. Returns None when the record already had a payload.
pub async fn attach_ai_payload(
    conn: &mut SqliteConnection,
    key: &RecordKey,
    ai: &AiValidation,
    at: DateTime<Utc>,
) -> Result<Option<VerificationRecord>> {
    let at = at.to_rfc3339();
    let approve = ai.ai_action == AiAction::AutoApprove;

    // SET expressions all see the pre-update row
    let row = sqlx::query(
        r#"
        UPDATE verification_records
        SET deepfake_score = ?, visual_quality_score = ?, ai_action = ?, ai_reason = ?, scored_at = ?,
            verification_status = CASE WHEN verification_status IS NULL AND flagged = 0 AND ?
                                       THEN 'REAL' ELSE verification_status END,
            verified_by = CASE WHEN verification_status IS NULL AND flagged = 0 AND ?
                               THEN ? ELSE verified_by END,
            decided_at = CASE WHEN verification_status IS NULL AND flagged = 0 AND ?
                              THEN ? ELSE decided_at END,
            version = version + 1, updated_at = ?
        WHERE batch_id = ? AND stage_name = ? AND image_url = ?
          AND deepfake_score IS NULL
        RETURNING *
        "#,
    )
    .bind(ai.deepfake_score)
    .bind(ai.visual_quality_score)
    .bind(ai.ai_action.as_str())
    .bind(&ai.ai_reason)
    .bind(ai.scored_at.to_rfc3339())
    .bind(approve)
    .bind(approve)
    .bind(SYSTEM_VERIFIER_ID)
    .bind(approve)
    .bind(&at)
    .bind(&at)
    .bind(key.batch_id.to_string())
    .bind(key.stage.as_str())
    .bind(&key.image_url)
    .fetch_optional(conn)
    .await?;

    row.map(|r| map_record(&r)).transpose()
}

fn map_record(row: &SqliteRow) -> Result<VerificationRecord> {
    let batch_id: String = row.get("batch_id");
    let stage_name: String = row.get("stage_name");

    let ai_action: Option<String> = row.get("ai_action");
    let ai_action: Option<AiAction> = ai_action.map(|a| parse_column("ai_action", &a)).transpose()?;

    let status: Option<String> = row.get("verification_status");
    let decision = match status {
        Some(status) => {
            let by: Option<String> = row.get("verified_by");
            let decided_at: Option<String> = row.get("decided_at");
            Decision::Decided {
                status: parse_column("verification_status", &status)?,
                reason: row.get("rejection_reason"),
                by: by.ok_or_else(|| Error::Internal("Decided record without verified_by".to_string()))?,
                at: parse_optional_timestamp("decided_at", decided_at)?
                    .ok_or_else(|| Error::Internal("Decided record without decided_at".to_string()))?,
            }
        }
        None => {
            let flagged: bool = row.get("flagged");
            Decision::Unreviewed {
                ai_action: ai_action.unwrap_or(AiAction::FlagForHuman),
                flagged,
                flag_note: row.get("flag_note"),
            }
        }
    };

    let deepfake_score: Option<f64> = row.get("deepfake_score");
    let visual_quality_score: Option<f64> = row.get("visual_quality_score");
    let scored_at: Option<String> = row.get("scored_at");
    let ai_validation = match (deepfake_score, visual_quality_score, ai_action, scored_at) {
        (Some(deepfake_score), Some(visual_quality_score), Some(ai_action), Some(scored_at)) => {
            let ai_reason: Option<String> = row.get("ai_reason");
            Some(AiValidation {
                deepfake_score,
                visual_quality_score,
                ai_action,
                ai_reason: ai_reason.unwrap_or_default(),
                scored_at: parse_timestamp("scored_at", &scored_at)?,
            })
        }
        _ => None,
    };

    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(VerificationRecord {
        key: RecordKey {
            batch_id: parse_uuid("batch_id", &batch_id)?,
            stage: parse_column("stage_name", &stage_name)?,
            image_url: row.get("image_url"),
        },
        farmer_id: row.get("farmer_id"),
        decision,
        ai_validation,
        version: row.get("version"),
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::batches::insert_batch;
    use crate::db::stages::{upsert_append, StageAppend};
    use crate::db::test_support::new_batch;
    use agp_common::db::connect_in_memory;

    fn scored(deepfake: f64, quality: f64, action: AiAction) -> AiValidation {
        AiValidation {
            deepfake_score: deepfake,
            visual_quality_score: quality,
            ai_action: action,
            ai_reason: "model v3".to_string(),
            scored_at: Utc::now(),
        }
    }

    fn pending(key: RecordKey, ai: Option<AiValidation>) -> VerificationRecord {
        let now = Utc::now();
        VerificationRecord {
            key,
            farmer_id: "farmer-1".to_string(),
            decision: Decision::Unreviewed {
                ai_action: ai.as_ref().map(|a| a.ai_action).unwrap_or(AiAction::FlagForHuman),
                flagged: false,
                flag_note: None,
            },
            ai_validation: ai,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Batch with one SOWING stage holding `images`, each with a record
    async fn setup(images: &[(&str, Option<AiValidation>)]) -> (SqlitePool, Uuid) {
        let pool = connect_in_memory().await.unwrap();
        let batch = new_batch("farmer-1");
        insert_batch(&pool, &batch).await.unwrap();

        let urls: Vec<String> = images.iter().map(|(u, _)| u.to_string()).collect();
        let mut tx = pool.begin().await.unwrap();
        for (url, ai) in images {
            let key = RecordKey::new(batch.batch_id, StageName::Sowing, *url);
            assert!(insert_if_absent(&mut tx, &pending(key, ai.clone())).await.unwrap());
        }
        upsert_append(
            &mut tx,
            &StageAppend {
                batch_id: batch.batch_id,
                stage: StageName::Sowing,
                image_urls: &urls,
                notes: None,
                status: None,
                min_images: 2,
                at: Utc::now(),
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        (pool, batch.batch_id)
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_per_key() {
        let (pool, batch_id) = setup(&[("u1", None), ("u2", None)]).await;
        let key = RecordKey::new(batch_id, StageName::Sowing, "u1");

        let mut conn = pool.acquire().await.unwrap();
        let again = pending(key.clone(), Some(scored(0.9, 0.9, AiAction::AutoReject)));
        assert!(!insert_if_absent(&mut conn, &again).await.unwrap());
        drop(conn);

        let loaded = get_record(&pool, &key).await.unwrap().unwrap();
        assert!(loaded.ai_validation.is_none());
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_reset_preserves_ai_payload_and_bumps_version() {
        let ai = scored(0.95, 0.8, AiAction::AutoReject);
        let (pool, batch_id) = setup(&[("u1", Some(ai.clone())), ("u2", None)]).await;
        let key = RecordKey::new(batch_id, StageName::Sowing, "u1");
        let mut conn = pool.acquire().await.unwrap();

        let decide = RecordUpdate::Decide {
            status: VerificationStatus::Fake,
            reason: Some("composited".to_string()),
            by: "admin-1".to_string(),
        };
        let written = update_record(&mut conn, &key, &decide, Some(1), Utc::now()).await.unwrap();
        let RecordWrite::Written(record) = written else { panic!("expected write") };
        assert_eq!(record.verification_status(), Some(VerificationStatus::Fake));
        assert_eq!(record.version, 2);

        let RecordWrite::Written(reset) = update_record(&mut conn, &key, &RecordUpdate::Reset, None, Utc::now()).await.unwrap() else {
            panic!("expected write")
        };
        assert!(reset.is_pending());
        assert!(reset.rejection_reason().is_none());
        assert_eq!(reset.ai_validation.as_ref().map(|a| a.deepfake_score), Some(0.95));
        assert!(reset.awaits_rejection_confirmation());
        assert_eq!(reset.version, 3);
    }

    #[tokio::test]
    async fn test_stale_version_detected() {
        let (pool, batch_id) = setup(&[("u1", None), ("u2", None)]).await;
        let key = RecordKey::new(batch_id, StageName::Sowing, "u1");
        let mut conn = pool.acquire().await.unwrap();

        let flag = RecordUpdate::Flag {
            note: Some("check lighting".to_string()),
        };
        assert!(matches!(update_record(&mut conn, &key, &flag, Some(1), Utc::now()).await.unwrap(), RecordWrite::Written(_)));
        assert_eq!(
            update_record(&mut conn, &key, &RecordUpdate::Reset, Some(1), Utc::now()).await.unwrap(),
            RecordWrite::Stale { actual: 2 }
        );

        let missing = RecordKey::new(batch_id, StageName::Sowing, "nope");
        assert_eq!(
            update_record(&mut conn, &missing, &RecordUpdate::Reset, None, Utc::now()).await.unwrap(),
            RecordWrite::Missing
        );
    }

    #[tokio::test]
    async fn test_fake_without_reason_is_refused() {
        let (pool, batch_id) = setup(&[("u1", None), ("u2", None)]).await;
        let key = RecordKey::new(batch_id, StageName::Sowing, "u1");
        let mut conn = pool.acquire().await.unwrap();

        let decide = RecordUpdate::Decide {
            status: VerificationStatus::Fake,
            reason: None,
            by: "admin-1".to_string(),
        };
        assert!(update_record(&mut conn, &key, &decide, None, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_review_queue_puts_auto_reject_first() {
        let (pool, batch_id) = setup(&[
            ("flagged.jpg", Some(scored(0.5, 0.9, AiAction::FlagForHuman))),
            ("rejected.jpg", Some(scored(0.95, 0.9, AiAction::AutoReject))),
            ("unscored.jpg", None),
        ])
        .await;

        let queue = review_queue(&pool, Some(batch_id), 50).await.unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue[0].key.image_url, "rejected.jpg");

        let elsewhere = review_queue(&pool, Some(Uuid::new_v4()), 50).await.unwrap();
        assert!(elsewhere.is_empty());
    }

    #[tokio::test]
    async fn test_attach_payload_auto_approves_pending_only() {
        let (pool, batch_id) = setup(&[("u1", None), ("u2", None)]).await;
        let k1 = RecordKey::new(batch_id, StageName::Sowing, "u1");
        let k2 = RecordKey::new(batch_id, StageName::Sowing, "u2");
        let mut conn = pool.acquire().await.unwrap();

        // u2 was decided by a human while the AI was down
        let decide = RecordUpdate::Decide {
            status: VerificationStatus::Fake,
            reason: Some("screenshot".to_string()),
            by: "admin-1".to_string(),
        };
        update_record(&mut conn, &k2, &decide, None, Utc::now()).await.unwrap();

        let approve = scored(0.1, 0.9, AiAction::AutoApprove);
        let r1 = attach_ai_payload(&mut conn, &k1, &approve, Utc::now()).await.unwrap().unwrap();
        assert_eq!(r1.verification_status(), Some(VerificationStatus::Real));
        assert!(r1.is_system_decision());

        let r2 = attach_ai_payload(&mut conn, &k2, &approve, Utc::now()).await.unwrap().unwrap();
        assert_eq!(r2.verification_status(), Some(VerificationStatus::Fake));
        assert_eq!(r2.verified_by(), Some("admin-1"));

        // Already scored: nothing to attach
        assert!(attach_ai_payload(&mut conn, &k1, &approve, Utc::now()).await.unwrap().is_none());
        drop(conn);

        let counts = stage_counts(&pool, batch_id).await.unwrap();
        assert_eq!(
            counts.get(&StageName::Sowing),
            Some(&DecisionCounts { real: 1, fake: 1, pending: 0 })
        );
    }
}
