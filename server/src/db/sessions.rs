//! Database operations for the sync_sessions table.

use crate::error::Result;
use chrono::{DateTime, Utc};
use fieldsync_engine::{SessionId, SessionStatus, SyncSession};
use sqlx::{PgPool, Row};

/// A stored session row.
#[derive(Debug)]
pub struct StoredSession(SyncSession);

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredSession {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = SessionStatus::parse(&status).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: format!("unknown session status '{status}'").into(),
        })?;
        Ok(StoredSession(SyncSession {
            id: row.try_get("id")?,
            start_time: row.try_get("start_time")?,
            last_connection_time: row.try_get("last_connection_time")?,
            sync_tick: row.try_get("sync_tick")?,
            status,
            error: row.try_get("error")?,
            snapshot_completed_at: row.try_get("snapshot_completed_at")?,
            completed_at: row.try_get("completed_at")?,
            outgoing_since: row.try_get("outgoing_since")?,
            advance_outgoing_cursor: row.try_get("advance_outgoing_cursor")?,
            debug_info: row.try_get("debug_info")?,
        }))
    }
}

pub async fn insert_session(pool: &PgPool, session: &SyncSession) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_sessions (
            id, start_time, last_connection_time, sync_tick, status, error,
            snapshot_completed_at, completed_at, outgoing_since,
            advance_outgoing_cursor, debug_info
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(session.id)
    .bind(session.start_time)
    .bind(session.last_connection_time)
    .bind(session.sync_tick)
    .bind(session.status.as_str())
    .bind(&session.error)
    .bind(session.snapshot_completed_at)
    .bind(session.completed_at)
    .bind(session.outgoing_since)
    .bind(session.advance_outgoing_cursor)
    .bind(&session.debug_info)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_session(pool: &PgPool, id: SessionId) -> Result<Option<SyncSession>> {
    let stored = sqlx::query_as::<_, StoredSession>(
        r#"
        SELECT id, start_time, last_connection_time, sync_tick, status, error,
               snapshot_completed_at, completed_at, outgoing_since,
               advance_outgoing_cursor, debug_info
        FROM sync_sessions
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(stored.map(|s| s.0))
}

/// Write back every mutable column. The heartbeat never moves backwards.
pub async fn update_session(pool: &PgPool, session: &SyncSession) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sync_sessions SET
            last_connection_time = GREATEST(last_connection_time, $2),
            status = $3,
            error = $4,
            snapshot_completed_at = $5,
            completed_at = $6,
            outgoing_since = $7,
            advance_outgoing_cursor = $8
        WHERE id = $1
        "#,
    )
    .bind(session.id)
    .bind(session.last_connection_time)
    .bind(session.status.as_str())
    .bind(&session.error)
    .bind(session.snapshot_completed_at)
    .bind(session.completed_at)
    .bind(session.outgoing_since)
    .bind(session.advance_outgoing_cursor)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn complete_snapshot(pool: &PgPool, id: SessionId, at: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE sync_sessions
        SET snapshot_completed_at = $2
        WHERE id = $1 AND completed_at IS NULL
        "#,
    )
    .bind(id)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn touch_session(pool: &PgPool, id: SessionId, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sync_sessions
        SET last_connection_time = GREATEST(last_connection_time, $2)
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Open sessions with no heartbeat since `before`.
pub async fn lapsed_sessions(pool: &PgPool, before: DateTime<Utc>) -> Result<Vec<SessionId>> {
    let ids = sqlx::query_scalar(
        r#"
        SELECT id FROM sync_sessions
        WHERE completed_at IS NULL AND last_connection_time < $1
        "#,
    )
    .bind(before)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}
