//! Database initialization
//!
//! Opens (or creates) the SQLite database and brings the schema up to date.
//! Every `create_*_table` function is idempotent, so startup can run them
//! unconditionally.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Busy timeout applied to every pooled connection
const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // WAL lets handlers read while a stage submission is writing
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .min_connections(2)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database with the full schema
///
/// The pool never recycles its connection: an in-memory SQLite database
/// lives exactly as long as the connection that created it.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create every table and index used by the verification service
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_settings_table(pool).await?;
    create_batches_table(pool).await?;
    create_stages_table(pool).await?;
    create_verification_records_table(pool).await?;
    create_appeals_table(pool).await?;
    create_certificates_table(pool).await?;

    Ok(())
}

/// Create the settings table
///
/// Stores runtime-tunable key-value pairs (triage thresholds).
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the batches table
///
/// Batches are never deleted; certificate metadata lives in `certificates`.
pub async fn create_batches_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batches (
            batch_id TEXT PRIMARY KEY,
            batch_code TEXT NOT NULL UNIQUE,
            farmer_id TEXT NOT NULL,
            crop_name TEXT NOT NULL,
            category TEXT,
            area REAL,
            area_unit TEXT,
            quantity REAL,
            quantity_unit TEXT,
            location TEXT,
            sowing_date TEXT,
            planting_date TEXT,
            expected_harvest_date TEXT,
            description TEXT,
            fertilizer_notes TEXT,
            pesticide_notes TEXT,
            status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (status IN ('PENDING', 'VERIFIED', 'REJECTED')),
            rejection_reason TEXT,
            verified_at TEXT,
            verified_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_batches_farmer ON batches(farmer_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_batches_status ON batches(status)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the stages table
///
/// `(batch_id, stage_name)` is the durable identity; `stage_id` is a surrogate.
/// `image_urls` is a JSON array in farmer-supplied order.
pub async fn create_stages_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stages (
            stage_id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL REFERENCES batches(batch_id),
            stage_name TEXT NOT NULL,
            stage_order INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (status IN ('PENDING', 'IN_PROGRESS', 'COMPLETED')),
            image_urls TEXT NOT NULL DEFAULT '[]',
            notes TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (batch_id, stage_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the verification_records table
///
/// One row per image per stage. The CHECK constraint enforces that a FAKE
/// decision always carries a non-empty rejection reason. `version` is bumped
/// on every write so stale clients can detect they were superseded.
pub async fn create_verification_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS verification_records (
            batch_id TEXT NOT NULL REFERENCES batches(batch_id),
            stage_name TEXT NOT NULL,
            image_url TEXT NOT NULL,
            farmer_id TEXT NOT NULL,
            verification_status TEXT
                CHECK (verification_status IS NULL OR verification_status IN ('REAL', 'FAKE')),
            rejection_reason TEXT,
            verified_by TEXT,
            decided_at TEXT,
            flagged INTEGER NOT NULL DEFAULT 0,
            flag_note TEXT,
            deepfake_score REAL,
            visual_quality_score REAL,
            ai_action TEXT
                CHECK (ai_action IS NULL OR ai_action IN ('AUTO_APPROVE', 'AUTO_REJECT', 'FLAG_FOR_HUMAN')),
            ai_reason TEXT,
            scored_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (batch_id, stage_name, image_url),
            CHECK (
                verification_status IS NOT 'FAKE'
                OR (rejection_reason IS NOT NULL AND length(trim(rejection_reason)) > 0)
            )
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_verification_pending ON verification_records(verification_status, ai_action)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the appeals table
///
/// The partial unique index allows at most one OPEN appeal per record.
pub async fn create_appeals_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS appeals (
            appeal_id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            stage_name TEXT NOT NULL,
            image_url TEXT NOT NULL,
            farmer_id TEXT NOT NULL,
            reason TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'OPEN'
                CHECK (status IN ('OPEN', 'RESOLVED')),
            resolution TEXT
                CHECK (resolution IS NULL OR resolution IN ('RESET_TO_PENDING', 'APPROVED_AS_REAL', 'REJECTION_UPHELD')),
            resolved_by TEXT,
            resolution_note TEXT,
            resolved_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (batch_id, stage_name, image_url)
                REFERENCES verification_records(batch_id, stage_name, image_url)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_appeals_one_open
        ON appeals(batch_id, stage_name, image_url)
        WHERE status = 'OPEN'
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_appeals_batch ON appeals(batch_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the certificates table
///
/// `batch_id` is the primary key: a batch gets at most one certificate, ever.
/// A row in state ISSUING is an in-flight issuance claim.
pub async fn create_certificates_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS certificates (
            batch_id TEXT PRIMARY KEY REFERENCES batches(batch_id),
            state TEXT NOT NULL CHECK (state IN ('ISSUING', 'ISSUED')),
            certificate_id TEXT UNIQUE,
            qr_payload TEXT,
            issued_at TEXT,
            revoked_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK (state = 'ISSUING' OR (certificate_id IS NOT NULL AND qr_payload IS NOT NULL))
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
