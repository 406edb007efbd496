//! Batch database operations
//!
//! Status changes are compare-and-set on the current status, so two admins
//! racing on the same batch cannot both apply a transition.

use agp_common::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{parse_column, parse_optional_timestamp, parse_timestamp, parse_uuid};
use crate::models::{Batch, BatchDetails, BatchStatus, CertificateInfo};

const SELECT_BATCH: &str = r#"
    SELECT b.batch_id, b.batch_code, b.farmer_id, b.crop_name, b.category,
           b.area, b.area_unit, b.quantity, b.quantity_unit, b.location,
           b.sowing_date, b.planting_date, b.expected_harvest_date,
           b.description, b.fertilizer_notes, b.pesticide_notes,
           b.status, b.rejection_reason, b.verified_at, b.verified_by,
           b.created_at, b.updated_at,
           c.state AS cert_state, c.certificate_id AS cert_id,
           c.qr_payload AS cert_qr, c.issued_at AS cert_issued_at,
           c.revoked_at AS cert_revoked_at
    FROM batches b
    LEFT JOIN certificates c ON c.batch_id = b.batch_id
"#;

/// Insert a newly created batch
pub async fn insert_batch(pool: &SqlitePool, batch: &Batch) -> Result<()> {
    let d = &batch.details;

    sqlx::query(
        r#"
        INSERT INTO batches (
            batch_id, batch_code, farmer_id, crop_name, category,
            area, area_unit, quantity, quantity_unit, location,
            sowing_date, planting_date, expected_harvest_date,
            description, fertilizer_notes, pesticide_notes,
            status, rejection_reason, verified_at, verified_by,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(batch.batch_id.to_string())
    .bind(&batch.batch_code)
    .bind(&batch.farmer_id)
    .bind(&d.crop_name)
    .bind(&d.category)
    .bind(d.area)
    .bind(&d.area_unit)
    .bind(d.quantity)
    .bind(&d.quantity_unit)
    .bind(&d.location)
    .bind(d.sowing_date.map(|v| v.to_string()))
    .bind(d.planting_date.map(|v| v.to_string()))
    .bind(d.expected_harvest_date.map(|v| v.to_string()))
    .bind(&d.description)
    .bind(&d.fertilizer_notes)
    .bind(&d.pesticide_notes)
    .bind(batch.status.as_str())
    .bind(&batch.rejection_reason)
    .bind(batch.verified_at.map(|v| v.to_rfc3339()))
    .bind(&batch.verified_by)
    .bind(batch.created_at.to_rfc3339())
    .bind(batch.updated_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Load a batch by id
pub async fn get_batch(pool: &SqlitePool, batch_id: Uuid) -> Result<Option<Batch>> {
    let row = sqlx::query(&format!("{} WHERE b.batch_id = ?", SELECT_BATCH))
        .bind(batch_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|r| map_batch(&r)).transpose()
}

/// Load a batch by its human-readable code
pub async fn get_batch_by_code(pool: &SqlitePool, batch_code: &str) -> Result<Option<Batch>> {
    let row = sqlx::query(&format!("{} WHERE b.batch_code = ?", SELECT_BATCH))
        .bind(batch_code)
        .fetch_optional(pool)
        .await?;

    row.map(|r| map_batch(&r)).transpose()
}

/// List batches, newest first, optionally filtered by farmer and status
pub async fn list_batches(
    pool: &SqlitePool,
    farmer_id: Option<&str>,
    status: Option<BatchStatus>,
) -> Result<Vec<Batch>> {
    let status = status.map(|s| s.as_str());

    let rows = sqlx::query(&format!(
        "{} WHERE (? IS NULL OR b.farmer_id = ?) AND (? IS NULL OR b.status = ?)
         ORDER BY b.created_at DESC, b.batch_code",
        SELECT_BATCH
    ))
    .bind(farmer_id)
    .bind(farmer_id)
    .bind(status)
    .bind(status)
    .fetch_all(pool)
    .await?;

    rows.iter().map(map_batch).collect()
}

/// Current status of a batch, or None when it does not exist
pub async fn get_status(conn: &mut SqliteConnection, batch_id: Uuid) -> Result<Option<BatchStatus>> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM batches WHERE batch_id = ?")
        .bind(batch_id.to_string())
        .fetch_optional(conn)
        .await?;

    status.map(|s| parse_column("status", &s)).transpose()
}

/// Move a batch from `from` to `to` if it is still in `from`
///
/// Entering VERIFIED stamps `verified_at`/`verified_by` and clears any
/// rejection reason; entering REJECTED stores `reason` and clears the
/// verification stamp. Returns false when the batch was no longer in `from`.
pub async fn transition_status(
    conn: &mut SqliteConnection,
    batch_id: Uuid,
    from: BatchStatus,
    to: BatchStatus,
    actor_id: &str,
    reason: Option<&str>,
    at: DateTime<Utc>,
) -> Result<bool> {
    let at = at.to_rfc3339();

    let result = match to {
        BatchStatus::Verified => {
            sqlx::query(
                r#"
                UPDATE batches
                SET status = 'VERIFIED', verified_at = ?, verified_by = ?,
                    rejection_reason = NULL, updated_at = ?
                WHERE batch_id = ? AND status = ?
                "#,
            )
            .bind(&at)
            .bind(actor_id)
            .bind(&at)
            .bind(batch_id.to_string())
            .bind(from.as_str())
            .execute(conn)
            .await?
        }
        BatchStatus::Rejected => {
            sqlx::query(
                r#"
                UPDATE batches
                SET status = 'REJECTED', rejection_reason = ?,
                    verified_at = NULL, verified_by = NULL, updated_at = ?
                WHERE batch_id = ? AND status = ?
                "#,
            )
            .bind(reason)
            .bind(&at)
            .bind(batch_id.to_string())
            .bind(from.as_str())
            .execute(conn)
            .await?
        }
        BatchStatus::Pending => {
            return Err(Error::InvalidInput("Batches never return to PENDING".to_string()));
        }
    };

    Ok(result.rows_affected() == 1)
}

fn parse_date(field: &str, value: Option<String>) -> Result<Option<NaiveDate>> {
    value
        .map(|v| {
            v.parse::<NaiveDate>()
                .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", field, e)))
        })
        .transpose()
}

fn map_batch(row: &SqliteRow) -> Result<Batch> {
    let batch_id: String = row.get("batch_id");
    let status: String = row.get("status");
    let status: BatchStatus = parse_column("status", &status)?;

    let details = BatchDetails {
        crop_name: row.get("crop_name"),
        category: row.get("category"),
        area: row.get("area"),
        area_unit: row.get("area_unit"),
        quantity: row.get("quantity"),
        quantity_unit: row.get("quantity_unit"),
        location: row.get("location"),
        sowing_date: parse_date("sowing_date", row.get("sowing_date"))?,
        planting_date: parse_date("planting_date", row.get("planting_date"))?,
        expected_harvest_date: parse_date("expected_harvest_date", row.get("expected_harvest_date"))?,
        description: row.get("description"),
        fertilizer_notes: row.get("fertilizer_notes"),
        pesticide_notes: row.get("pesticide_notes"),
    };

    // Certificate metadata is only visible on a VERIFIED batch with an
    // issued, unrevoked certificate
    let cert_state: Option<String> = row.get("cert_state");
    let cert_revoked_at: Option<String> = row.get("cert_revoked_at");
    let certificate = match (cert_state.as_deref(), &cert_revoked_at, status) {
        (Some("ISSUED"), None, BatchStatus::Verified) => {
            let issued_at: Option<String> = row.get("cert_issued_at");
            let issued_at = parse_optional_timestamp("issued_at", issued_at)?
                .ok_or_else(|| Error::Internal("Issued certificate without issued_at".to_string()))?;
            Some(CertificateInfo {
                certificate_id: row.get("cert_id"),
                qr_payload: row.get("cert_qr"),
                issued_at,
            })
        }
        _ => None,
    };

    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Batch {
        batch_id: parse_uuid("batch_id", &batch_id)?,
        batch_code: row.get("batch_code"),
        farmer_id: row.get("farmer_id"),
        details,
        status,
        rejection_reason: row.get("rejection_reason"),
        verified_at: parse_optional_timestamp("verified_at", row.get("verified_at"))?,
        verified_by: row.get("verified_by"),
        certificate,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}
