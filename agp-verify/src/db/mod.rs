//! Database access for agp-verify
//!
//! Each module owns one table. Functions take a `&SqlitePool` for standalone
//! statements and a `&mut SqliteConnection` where the caller may want to run
//! them inside a transaction. Row mapping helpers live here.

pub mod appeals;
pub mod batches;
pub mod certificates;
pub mod settings;
pub mod stages;
pub mod verifications;

use agp_common::{Error, Result};
use chrono::{DateTime, Utc};
use std::str::FromStr;
use uuid::Uuid;

/// Lock wait applied to writers when the settings table has no override
pub const DEFAULT_MAX_LOCK_WAIT_MS: u64 = 5000;

/// Predicate selecting records whose image is on the persisted stage
///
/// Expects the record table aliased `v`. Records for images uploaded by a
/// submission that never reached the minimum count are excluded.
pub(crate) const ATTACHED_TO_STAGE: &str = r#"
    EXISTS (
        SELECT 1 FROM stages s, json_each(s.image_urls) j
        WHERE s.batch_id = v.batch_id
          AND s.stage_name = v.stage_name
          AND j.value = v.image_url
    )
"#;

pub(crate) fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", field, e)))
}

pub(crate) fn parse_optional_timestamp(field: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_timestamp(field, &v)).transpose()
}

pub(crate) fn parse_uuid(field: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Internal(format!("Invalid {} '{}': {}", field, value, e)))
}

/// Parse a stored enum column via its `FromStr` impl
pub(crate) fn parse_column<T>(field: &str, value: &str) -> Result<T>
where
    T: FromStr<Err = String>,
{
    value
        .parse::<T>()
        .map_err(|e| Error::Internal(format!("Corrupt {} column: {}", field, e)))
}
