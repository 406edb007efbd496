//! Stage database operations
//!
//! A stage row appears the first time a submission reaches the minimum image
//! count; later submissions append to its `image_urls`.

use agp_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{parse_column, parse_timestamp, parse_uuid};
use crate::models::{Stage, StageName, StageStatus};

const SELECT_STAGE: &str = r#"
    SELECT stage_id, batch_id, stage_name, status, image_urls, notes, created_at, updated_at
    FROM stages
"#;

/// What a submission writes onto the stage row
#[derive(Debug, Clone)]
pub struct StageAppend<'a> {
    pub batch_id: Uuid,
    pub stage: StageName,
    /// Appended in order; URLs already on the stage are skipped
    pub image_urls: &'a [String],
    /// Replaces the stored notes when present
    pub notes: Option<&'a str>,
    /// Replaces the stored status when present
    pub status: Option<StageStatus>,
    /// Nothing is written unless the merged image list reaches this size
    pub min_images: usize,
    pub at: DateTime<Utc>,
}

/// Load one stage
pub async fn get_stage(pool: &SqlitePool, batch_id: Uuid, stage: StageName) -> Result<Option<Stage>> {
    let row = sqlx::query(&format!("{} WHERE batch_id = ? AND stage_name = ?", SELECT_STAGE))
        .bind(batch_id.to_string())
        .bind(stage.as_str())
        .fetch_optional(pool)
        .await?;

    row.map(|r| map_stage(&r)).transpose()
}

/// All persisted stages of a batch in cultivation order
pub async fn list_stages(pool: &SqlitePool, batch_id: Uuid) -> Result<Vec<Stage>> {
    let rows = sqlx::query(&format!("{} WHERE batch_id = ? ORDER BY stage_order", SELECT_STAGE))
        .bind(batch_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter().map(map_stage).collect()
}

/// Create the stage or append to it, returning the stored row
///
/// Returns None, writing nothing, when the merged image list would stay
/// below `min_images`. Must run inside a transaction: the read-modify-write
/// of `image_urls` is only atomic when the caller holds the write lock for
/// both statements.
pub async fn upsert_append(conn: &mut SqliteConnection, append: &StageAppend<'_>) -> Result<Option<Stage>> {
    let existing = sqlx::query(&format!("{} WHERE batch_id = ? AND stage_name = ?", SELECT_STAGE))
        .bind(append.batch_id.to_string())
        .bind(append.stage.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    let existing = existing.map(|r| map_stage(&r)).transpose()?;

    let at = append.at.to_rfc3339();

    match existing {
        None => {
            let image_urls = dedup_preserving_order(&[], append.image_urls);
            if image_urls.len() < append.min_images {
                return Ok(None);
            }

            let stage = Stage {
                stage_id: Uuid::new_v4(),
                batch_id: append.batch_id,
                stage_name: append.stage,
                status: append.status.unwrap_or_default(),
                image_urls,
                notes: append.notes.unwrap_or_default().to_string(),
                created_at: append.at,
                updated_at: append.at,
            };

            sqlx::query(
                r#"
                INSERT INTO stages (
                    stage_id, batch_id, stage_name, stage_order, status,
                    image_urls, notes, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(stage.stage_id.to_string())
            .bind(stage.batch_id.to_string())
            .bind(stage.stage_name.as_str())
            .bind(stage.stage_name.order())
            .bind(stage.status.as_str())
            .bind(encode_urls(&stage.image_urls)?)
            .bind(&stage.notes)
            .bind(&at)
            .bind(&at)
            .execute(&mut *conn)
            .await?;

            Ok(Some(stage))
        }
        Some(mut stage) => {
            let image_urls = dedup_preserving_order(&stage.image_urls, append.image_urls);
            if image_urls.len() < append.min_images {
                return Ok(None);
            }
            stage.image_urls = image_urls;
            if let Some(notes) = append.notes {
                stage.notes = notes.to_string();
            }
            if let Some(status) = append.status {
                stage.status = status;
            }
            stage.updated_at = append.at;

            sqlx::query(
                "UPDATE stages SET image_urls = ?, notes = ?, status = ?, updated_at = ? WHERE stage_id = ?",
            )
            .bind(encode_urls(&stage.image_urls)?)
            .bind(&stage.notes)
            .bind(stage.status.as_str())
            .bind(&at)
            .bind(stage.stage_id.to_string())
            .execute(&mut *conn)
            .await?;

            Ok(Some(stage))
        }
    }
}

fn dedup_preserving_order(existing: &[String], new: &[String]) -> Vec<String> {
    let mut merged = existing.to_vec();
    for url in new {
        if !merged.contains(url) {
            merged.push(url.clone());
        }
    }
    merged
}

fn encode_urls(urls: &[String]) -> Result<String> {
    serde_json::to_string(urls).map_err(|e| Error::Internal(format!("Failed to serialize image_urls: {}", e)))
}

fn map_stage(row: &SqliteRow) -> Result<Stage> {
    let stage_id: String = row.get("stage_id");
    let batch_id: String = row.get("batch_id");
    let stage_name: String = row.get("stage_name");
    let status: String = row.get("status");
    let image_urls: String = row.get("image_urls");
    let image_urls: Vec<String> = serde_json::from_str(&image_urls)
        .map_err(|e| Error::Internal(format!("Failed to deserialize image_urls: {}", e)))?;
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Stage {
        stage_id: parse_uuid("stage_id", &stage_id)?,
        batch_id: parse_uuid("batch_id", &batch_id)?,
        stage_name: parse_column("stage_name", &stage_name)?,
        status: parse_column("status", &status)?,
        image_urls,
        notes: row.get("notes"),
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}
