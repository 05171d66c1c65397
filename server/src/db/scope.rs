//! Lookups that decide what a facility receives.

use crate::error::Result;
use fieldsync_engine::{RecordId, Tick};
use sqlx::PgPool;

/// Patients linked to a facility, with the tick each link was written at.
pub async fn facility_patients(pool: &PgPool, facility_id: &str) -> Result<Vec<(RecordId, Tick)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT patient_id, updated_at_sync_tick
        FROM patient_facilities
        WHERE facility_id = $1 AND deleted_at IS NULL
        "#,
    )
    .bind(facility_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// A facility's setting, or the deployment-wide one.
pub async fn setting(
    pool: &PgPool,
    facility_id: Option<&str>,
    key: &str,
) -> Result<Option<serde_json::Value>> {
    let value = sqlx::query_scalar(
        r#"
        SELECT value
        FROM facility_settings
        WHERE key = $2 AND (facility_id = $1 OR facility_id IS NULL)
        ORDER BY facility_id NULLS LAST
        LIMIT 1
        "#,
    )
    .bind(facility_id)
    .bind(key)
    .fetch_optional(pool)
    .await?;
    Ok(value)
}
