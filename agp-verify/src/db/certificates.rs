//! Certificate database operations
//!
//! Issuance is a two-step claim: a conditional INSERT of an ISSUING row that
//! re-checks every gate condition in the same statement, then completion
//! once the issuer has answered. The `batch_id` primary key makes a second
//! claim impossible, so the issuer is called at most once per batch.

use agp_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{parse_optional_timestamp, parse_timestamp};
use crate::models::{CertificateInfo, StageName, MIN_STAGE_IMAGES};

/// Outcome of an issuance claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Caller now owns issuance for this batch
    Claimed,
    /// A gate condition does not hold
    NotEligible,
    /// Another caller is talking to the issuer
    InProgress,
    AlreadyIssued,
}

/// Stored certificate row
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateRow {
    pub batch_id: Uuid,
    pub issuing: bool,
    pub info: Option<CertificateInfo>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl CertificateRow {
    pub fn is_active(&self) -> bool {
        self.info.is_some() && self.revoked_at.is_none()
    }
}

/// Atomically check the gate and claim issuance
pub async fn claim_issuance(pool: &SqlitePool, batch_id: Uuid, at: DateTime<Utc>) -> Result<ClaimOutcome> {
    let at = at.to_rfc3339();

    let result = sqlx::query(
        r#"
        INSERT INTO certificates (batch_id, state, created_at, updated_at)
        SELECT b.batch_id, 'ISSUING', ?, ?
        FROM batches b
        WHERE b.batch_id = ?
          AND b.status = 'VERIFIED'
          AND (
              SELECT COUNT(*) FROM stages s
              WHERE s.batch_id = b.batch_id AND json_array_length(s.image_urls) >= ?
          ) = ?
          AND NOT EXISTS (
              SELECT 1 FROM verification_records v
              JOIN stages s ON s.batch_id = v.batch_id AND s.stage_name = v.stage_name
              WHERE v.batch_id = b.batch_id
                AND v.verification_status = 'FAKE'
                AND EXISTS (SELECT 1 FROM json_each(s.image_urls) j WHERE j.value = v.image_url)
          )
        ON CONFLICT(batch_id) DO NOTHING
        "#,
    )
    .bind(&at)
    .bind(&at)
    .bind(batch_id.to_string())
    .bind(MIN_STAGE_IMAGES as i64)
    .bind(StageName::ALL.len() as i64)
    .execute(pool)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(ClaimOutcome::Claimed);
    }

    Ok(match get_certificate(pool, batch_id).await? {
        None => ClaimOutcome::NotEligible,
        Some(row) if row.issuing => ClaimOutcome::InProgress,
        Some(_) => ClaimOutcome::AlreadyIssued,
    })
}

/// Record the issuer's answer on a claimed row
///
/// If the batch left VERIFIED while the issuer was working, the certificate
/// is stored already revoked. Returns the stored row.
pub async fn complete_issuance(
    pool: &SqlitePool,
    batch_id: Uuid,
    certificate_id: &str,
    qr_payload: &str,
    at: DateTime<Utc>,
) -> Result<CertificateRow> {
    let at = at.to_rfc3339();

    let row = sqlx::query(
        r#"
        UPDATE certificates
        SET state = 'ISSUED', certificate_id = ?, qr_payload = ?, issued_at = ?,
            revoked_at = CASE
                WHEN (SELECT status FROM batches WHERE batch_id = certificates.batch_id) = 'VERIFIED'
                THEN NULL ELSE ?
            END,
            updated_at = ?
        WHERE batch_id = ? AND state = 'ISSUING'
        RETURNING batch_id, state, certificate_id, qr_payload, issued_at, revoked_at
        "#,
    )
    .bind(certificate_id)
    .bind(qr_payload)
    .bind(&at)
    .bind(&at)
    .bind(&at)
    .bind(batch_id.to_string())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => map_certificate(&row),
        None => Err(Error::Internal(format!(
            "No issuance claim for batch {} to complete",
            batch_id
        ))),
    }
}

/// Drop an ISSUING claim after the issuer failed
pub async fn release_claim(pool: &SqlitePool, batch_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM certificates WHERE batch_id = ? AND state = 'ISSUING'")
        .bind(batch_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Drop every ISSUING claim; run at startup when nothing can be in flight
pub async fn clear_interrupted_claims(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM certificates WHERE state = 'ISSUING'")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Mark an active certificate revoked; returns its id if one was revoked
pub async fn revoke(conn: &mut SqliteConnection, batch_id: Uuid, at: DateTime<Utc>) -> Result<Option<String>> {
    let at = at.to_rfc3339();
    let id: Option<String> = sqlx::query_scalar(
        r#"
        UPDATE certificates SET revoked_at = ?, updated_at = ?
        WHERE batch_id = ? AND state = 'ISSUED' AND revoked_at IS NULL
        RETURNING certificate_id
        "#,
    )
    .bind(&at)
    .bind(&at)
    .bind(batch_id.to_string())
    .fetch_optional(conn)
    .await?;

    Ok(id)
}

/// Lift a revocation; returns the certificate id if one was reinstated
pub async fn reinstate(conn: &mut SqliteConnection, batch_id: Uuid, at: DateTime<Utc>) -> Result<Option<String>> {
    let id: Option<String> = sqlx::query_scalar(
        r#"
        UPDATE certificates SET revoked_at = NULL, updated_at = ?
        WHERE batch_id = ? AND state = 'ISSUED' AND revoked_at IS NOT NULL
        RETURNING certificate_id
        "#,
    )
    .bind(at.to_rfc3339())
    .bind(batch_id.to_string())
    .fetch_optional(conn)
    .await?;

    Ok(id)
}

pub async fn get_certificate(pool: &SqlitePool, batch_id: Uuid) -> Result<Option<CertificateRow>> {
    let row = sqlx::query(
        "SELECT batch_id, state, certificate_id, qr_payload, issued_at, revoked_at FROM certificates WHERE batch_id = ?",
    )
    .bind(batch_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(|r| map_certificate(&r)).transpose()
}

fn map_certificate(row: &sqlx::sqlite::SqliteRow) -> Result<CertificateRow> {
    let batch_id: String = row.get("batch_id");
    let state: String = row.get("state");
    let certificate_id: Option<String> = row.get("certificate_id");
    let qr_payload: Option<String> = row.get("qr_payload");
    let issued_at: Option<String> = row.get("issued_at");

    let info = match (certificate_id, qr_payload, issued_at) {
        (Some(certificate_id), Some(qr_payload), Some(issued_at)) => Some(CertificateInfo {
            certificate_id,
            qr_payload,
            issued_at: parse_timestamp("issued_at", &issued_at)?,
        }),
        _ => None,
    };

    Ok(CertificateRow {
        batch_id: super::parse_uuid("batch_id", &batch_id)?,
        issuing: state == "ISSUING",
        info,
        revoked_at: parse_optional_timestamp("revoked_at", row.get("revoked_at"))?,
    })
}
