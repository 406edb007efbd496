//! Settings database operations
//!
//! Key-value accessors for runtime-tunable values. Triage thresholds stored
//! here override the TOML configuration.

use agp_common::{Error, Result};
use sqlx::{Pool, Sqlite};

use super::DEFAULT_MAX_LOCK_WAIT_MS;

pub const TRIAGE_LOW_THRESHOLD_KEY: &str = "triage_low_threshold";
pub const TRIAGE_HIGH_THRESHOLD_KEY: &str = "triage_high_threshold";
pub const TRIAGE_MIN_QUALITY_KEY: &str = "triage_min_quality";
pub const MAX_LOCK_WAIT_KEY: &str = "database_max_lock_wait_ms";

/// Triage threshold overrides; `None` fields fall through to configuration
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TriageOverrides {
    pub low_threshold: Option<f64>,
    pub high_threshold: Option<f64>,
    pub min_quality: Option<f64>,
}

/// Read triage overrides from the settings table
pub async fn get_triage_overrides(db: &Pool<Sqlite>) -> Result<TriageOverrides> {
    Ok(TriageOverrides {
        low_threshold: get_setting(db, TRIAGE_LOW_THRESHOLD_KEY).await?,
        high_threshold: get_setting(db, TRIAGE_HIGH_THRESHOLD_KEY).await?,
        min_quality: get_setting(db, TRIAGE_MIN_QUALITY_KEY).await?,
    })
}

/// Persist all three triage thresholds in one transaction
pub async fn set_triage_thresholds(db: &Pool<Sqlite>, low: f64, high: f64, min_quality: f64) -> Result<()> {
    let mut tx = db.begin().await?;

    for (key, value) in [
        (TRIAGE_LOW_THRESHOLD_KEY, low),
        (TRIAGE_HIGH_THRESHOLD_KEY, high),
        (TRIAGE_MIN_QUALITY_KEY, min_quality),
    ] {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value.to_string())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Remove triage overrides so configuration values apply again
pub async fn clear_triage_overrides(db: &Pool<Sqlite>) -> Result<()> {
    sqlx::query("DELETE FROM settings WHERE key IN (?, ?, ?)")
        .bind(TRIAGE_LOW_THRESHOLD_KEY)
        .bind(TRIAGE_HIGH_THRESHOLD_KEY)
        .bind(TRIAGE_MIN_QUALITY_KEY)
        .execute(db)
        .await?;
    Ok(())
}

/// Maximum time writers keep retrying on lock contention
///
/// **Default:** 5000 ms
pub async fn get_max_lock_wait_ms(db: &Pool<Sqlite>) -> Result<u64> {
    get_setting(db, MAX_LOCK_WAIT_KEY)
        .await
        .map(|opt| opt.unwrap_or(DEFAULT_MAX_LOCK_WAIT_MS))
}

/// Generic setting getter
pub async fn get_setting<T>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let row: Option<(Option<String>,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await
        .map_err(Error::Database)?;

    match row {
        Some((Some(value),)) => {
            let parsed = value
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Parse setting '{}' failed: {}", key, e)))?;
            Ok(Some(parsed))
        }
        _ => Ok(None),
    }
}

/// Generic setting setter
pub async fn set_setting<T>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()>
where
    T: std::fmt::Display,
{
    sqlx::query(
        "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await
    .map_err(Error::Database)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agp_common::db::connect_in_memory;

    #[tokio::test]
    async fn test_triage_overrides_absent_by_default() {
        let pool = connect_in_memory().await.unwrap();
        let overrides = get_triage_overrides(&pool).await.unwrap();
        assert_eq!(overrides, TriageOverrides::default());
    }

    #[tokio::test]
    async fn test_set_and_clear_triage_thresholds() {
        let pool = connect_in_memory().await.unwrap();

        set_triage_thresholds(&pool, 0.25, 0.8, 0.5).await.unwrap();
        let overrides = get_triage_overrides(&pool).await.unwrap();
        assert_eq!(overrides.low_threshold, Some(0.25));
        assert_eq!(overrides.high_threshold, Some(0.8));
        assert_eq!(overrides.min_quality, Some(0.5));

        clear_triage_overrides(&pool).await.unwrap();
        assert_eq!(get_triage_overrides(&pool).await.unwrap(), TriageOverrides::default());
    }

    #[tokio::test]
    async fn test_unparseable_setting_is_config_error() {
        let pool = connect_in_memory().await.unwrap();
        set_setting(&pool, MAX_LOCK_WAIT_KEY, "soon").await.unwrap();

        let result = get_max_lock_wait_ms(&pool).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_lock_wait_default() {
        let pool = connect_in_memory().await.unwrap();
        assert_eq!(get_max_lock_wait_ms(&pool).await.unwrap(), DEFAULT_MAX_LOCK_WAIT_MS);
    }
}
