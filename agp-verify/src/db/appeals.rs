//! Appeal database operations

use agp_common::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{parse_column, parse_optional_timestamp, parse_timestamp, parse_uuid};
use crate::models::{Appeal, AppealResolution};

const SELECT_APPEAL: &str = r#"
    SELECT appeal_id, batch_id, stage_name, image_url, farmer_id, reason,
           status, resolution, resolved_by, resolution_note, resolved_at,
           created_at, updated_at
    FROM appeals
"#;

/// Insert an OPEN appeal only if the appealed record is currently FAKE
///
/// The FAKE check and the insert are one statement. Returns false when the
/// record is not FAKE or another appeal on it is still open; the caller
/// re-reads to tell which.
pub async fn insert_if_fake(pool: &SqlitePool, appeal: &Appeal) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO appeals (
            appeal_id, batch_id, stage_name, image_url, farmer_id, reason,
            status, created_at, updated_at
        )
        SELECT ?, v.batch_id, v.stage_name, v.image_url, ?, ?, 'OPEN', ?, ?
        FROM verification_records v
        WHERE v.batch_id = ? AND v.stage_name = ? AND v.image_url = ?
          AND v.verification_status = 'FAKE'
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(appeal.appeal_id.to_string())
    .bind(&appeal.farmer_id)
    .bind(&appeal.reason)
    .bind(appeal.created_at.to_rfc3339())
    .bind(appeal.updated_at.to_rfc3339())
    .bind(appeal.batch_id.to_string())
    .bind(appeal.stage.as_str())
    .bind(&appeal.image_url)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get_appeal(conn: &mut SqliteConnection, appeal_id: Uuid) -> Result<Option<Appeal>> {
    let row = sqlx::query(&format!("{} WHERE appeal_id = ?", SELECT_APPEAL))
        .bind(appeal_id.to_string())
        .fetch_optional(conn)
        .await?;

    row.map(|r| map_appeal(&r)).transpose()
}

/// List appeals, oldest first
pub async fn list_appeals(pool: &SqlitePool, batch_id: Option<Uuid>, open_only: bool) -> Result<Vec<Appeal>> {
    let batch_id = batch_id.map(|id| id.to_string());

    let rows = sqlx::query(&format!(
        "{} WHERE (? IS NULL OR batch_id = ?) AND (? = 0 OR status = 'OPEN') ORDER BY created_at, appeal_id",
        SELECT_APPEAL
    ))
    .bind(&batch_id)
    .bind(&batch_id)
    .bind(open_only)
    .fetch_all(pool)
    .await?;

    rows.iter().map(map_appeal).collect()
}

/// Close an OPEN appeal; returns false if it was not open
pub async fn mark_resolved(
    conn: &mut SqliteConnection,
    appeal_id: Uuid,
    resolution: AppealResolution,
    resolved_by: &str,
    note: Option<&str>,
    at: DateTime<Utc>,
) -> Result<bool> {
    let at = at.to_rfc3339();

    let result = sqlx::query(
        r#"
        UPDATE appeals
        SET status = 'RESOLVED', resolution = ?, resolved_by = ?, resolution_note = ?,
            resolved_at = ?, updated_at = ?
        WHERE appeal_id = ? AND status = 'OPEN'
        "#,
    )
    .bind(resolution.as_str())
    .bind(resolved_by)
    .bind(note)
    .bind(&at)
    .bind(&at)
    .bind(appeal_id.to_string())
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

fn map_appeal(row: &SqliteRow) -> Result<Appeal> {
    let appeal_id: String = row.get("appeal_id");
    let batch_id: String = row.get("batch_id");
    let stage_name: String = row.get("stage_name");
    let status: String = row.get("status");
    let resolution: Option<String> = row.get("resolution");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Appeal {
        appeal_id: parse_uuid("appeal_id", &appeal_id)?,
        batch_id: parse_uuid("batch_id", &batch_id)?,
        stage: parse_column("stage_name", &stage_name)?,
        image_url: row.get("image_url"),
        farmer_id: row.get("farmer_id"),
        reason: row.get("reason"),
        status: parse_column("status", &status)?,
        resolution: resolution.map(|r| parse_column("resolution", &r)).transpose()?,
        resolved_by: row.get("resolved_by"),
        resolution_note: row.get("resolution_note"),
        resolved_at: parse_optional_timestamp("resolved_at", row.get("resolved_at"))?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::batches::insert_batch;
    use crate::db::test_support::new_batch;
    use crate::db::verifications::{insert_if_absent, update_record, RecordUpdate};
    use crate::models::{AiAction, AppealStatus, Decision, RecordKey, StageName, VerificationRecord, VerificationStatus};
    use agp_common::db::connect_in_memory;

    async fn setup() -> (SqlitePool, RecordKey) {
        let pool = connect_in_memory().await.unwrap();
        let batch = new_batch("farmer-1");
        insert_batch(&pool, &batch).await.unwrap();

        let key = RecordKey::new(batch.batch_id, StageName::Germination, "https://img/g1.jpg");
        let now = Utc::now();
        let record = VerificationRecord {
            key: key.clone(),
            farmer_id: "farmer-1".to_string(),
            decision: Decision::Unreviewed {
                ai_action: AiAction::FlagForHuman,
                flagged: false,
                flag_note: None,
            },
            ai_validation: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let mut conn = pool.acquire().await.unwrap();
        insert_if_absent(&mut conn, &record).await.unwrap();
        drop(conn);

        (pool, key)
    }

    fn appeal_for(key: &RecordKey) -> Appeal {
        let now = Utc::now();
        Appeal {
            appeal_id: Uuid::new_v4(),
            batch_id: key.batch_id,
            stage: key.stage,
            image_url: key.image_url.clone(),
            farmer_id: "farmer-1".to_string(),
            reason: "photo taken on site".to_string(),
            status: AppealStatus::Open,
            resolution: None,
            resolved_by: None,
            resolution_note: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn mark_fake(pool: &SqlitePool, key: &RecordKey) {
        let mut conn = pool.acquire().await.unwrap();
        let decide = RecordUpdate::Decide {
            status: VerificationStatus::Fake,
            reason: Some("duplicate of stock photo".to_string()),
            by: "admin-1".to_string(),
        };
        update_record(&mut conn, key, &decide, None, Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_record_cannot_be_appealed() {
        let (pool, key) = setup().await;
        assert!(!insert_if_fake(&pool, &appeal_for(&key)).await.unwrap());
        assert!(list_appeals(&pool, None, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_open_appeal_per_record() {
        let (pool, key) = setup().await;
        mark_fake(&pool, &key).await;

        let first = appeal_for(&key);
        assert!(insert_if_fake(&pool, &first).await.unwrap());
        assert!(!insert_if_fake(&pool, &appeal_for(&key)).await.unwrap());

        let open = list_appeals(&pool, Some(key.batch_id), true).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].appeal_id, first.appeal_id);

        let mut conn = pool.acquire().await.unwrap();
        assert!(mark_resolved(&mut conn, first.appeal_id, AppealResolution::RejectionUpheld, "admin-2", None, Utc::now())
            .await
            .unwrap());
        assert!(!mark_resolved(&mut conn, first.appeal_id, AppealResolution::ApprovedAsReal, "admin-2", None, Utc::now())
            .await
            .unwrap());
        let resolved = get_appeal(&mut conn, first.appeal_id).await.unwrap().unwrap();
        drop(conn);
        assert_eq!(resolved.resolution, Some(AppealResolution::RejectionUpheld));
        assert!(!resolved.is_open());

        // Record is still FAKE, so a fresh appeal may be filed
        assert!(insert_if_fake(&pool, &appeal_for(&key)).await.unwrap());
        assert_eq!(list_appeals(&pool, Some(key.batch_id), true).await.unwrap().len(), 1);
        assert_eq!(list_appeals(&pool, Some(key.batch_id), false).await.unwrap().len(), 2);
    }
}
