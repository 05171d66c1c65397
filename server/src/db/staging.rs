//! Database operations for the sync_session_records staging table.

use crate::error::Result;
use crate::store::RecordKey;
use fieldsync_engine::{
    Direction, NewSessionRecord, RecordType, SessionId, StagingKey, SyncSessionRecord,
};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::HashMap;

/// Rows per multi-row insert; keeps the bind count under the protocol limit.
const INSERT_CHUNK: usize = 1_000;

/// A stored staging row, with its page position when selected for paging.
#[derive(Debug)]
pub struct StoredStagingRow {
    pub rank: Option<i32>,
    pub record: SyncSessionRecord,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredStagingRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        let direction: String = row.try_get("direction")?;
        let direction = Direction::parse(&direction).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "direction".to_string(),
            source: format!("unknown direction '{direction}'").into(),
        })?;
        let data: sqlx::types::Json<serde_json::Map<String, serde_json::Value>> =
            row.try_get("data")?;
        Ok(StoredStagingRow {
            rank: row.try_get("rank").ok(),
            record: SyncSessionRecord {
                id: row.try_get("id")?,
                session_id: row.try_get("session_id")?,
                direction,
                record_type: row.try_get("record_type")?,
                record_id: row.try_get("record_id")?,
                is_deleted: row.try_get("is_deleted")?,
                data: data.0,
                saved_at_sync_tick: row.try_get("saved_at_sync_tick")?,
                updated_at_by_field_sum: row.try_get("updated_at_by_field_sum")?,
            },
        })
    }
}

pub async fn insert_staging(pool: &PgPool, records: &[NewSessionRecord]) -> Result<()> {
    for chunk in records.chunks(INSERT_CHUNK) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO sync_session_records (session_id, direction, record_type, record_id, \
             is_deleted, data, saved_at_sync_tick, updated_at_by_field_sum) ",
        );
        qb.push_values(chunk, |mut row, record| {
            row.push_bind(record.session_id)
                .push_bind(record.direction.as_str())
                .push_bind(&record.record_type)
                .push_bind(&record.record_id)
                .push_bind(record.is_deleted)
                .push_bind(sqlx::types::Json(&record.data))
                .push_bind(record.saved_at_sync_tick)
                .push_bind(record.updated_at_by_field_sum);
        });
        qb.build().execute(pool).await?;
    }
    Ok(())
}

pub async fn count_staging(pool: &PgPool, session_id: SessionId, direction: Direction) -> Result<i64> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sync_session_records WHERE session_id = $1 AND direction = $2",
    )
    .bind(session_id)
    .bind(direction.as_str())
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Keyset page ordered by the position of the record type in `type_order`,
/// then by staging id. Types missing from `type_order` are never returned.
pub async fn fetch_staging_page(
    pool: &PgPool,
    session_id: SessionId,
    direction: Direction,
    type_order: &[RecordType],
    after: Option<StagingKey>,
    limit: i64,
) -> Result<Vec<(StagingKey, SyncSessionRecord)>> {
    let after = after.unwrap_or(StagingKey { rank: -1, id: 0 });
    let rows = sqlx::query_as::<_, StoredStagingRow>(
        r#"
        SELECT (o.rank - 1)::int AS rank, s.id, s.session_id, s.direction, s.record_type,
               s.record_id, s.is_deleted, s.data, s.saved_at_sync_tick,
               s.updated_at_by_field_sum
        FROM sync_session_records s
        JOIN UNNEST($3::text[]) WITH ORDINALITY AS o(record_type, rank)
          ON o.record_type = s.record_type
        WHERE s.session_id = $1 AND s.direction = $2
          AND ((o.rank - 1)::int, s.id) > ($4, $5)
        ORDER BY o.rank, s.id
        LIMIT $6
        "#,
    )
    .bind(session_id)
    .bind(direction.as_str())
    .bind(type_order)
    .bind(after.rank)
    .bind(after.id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let key = StagingKey {
                rank: row.rank.unwrap_or_default(),
                id: row.record.id,
            };
            (key, row.record)
        })
        .collect())
}

pub async fn fetch_staging(
    pool: &PgPool,
    session_id: SessionId,
    direction: Direction,
) -> Result<Vec<SyncSessionRecord>> {
    let rows = sqlx::query_as::<_, StoredStagingRow>(
        r#"
        SELECT id, session_id, direction, record_type, record_id, is_deleted, data,
               saved_at_sync_tick, updated_at_by_field_sum
        FROM sync_session_records
        WHERE session_id = $1 AND direction = $2
        ORDER BY id
        "#,
    )
    .bind(session_id)
    .bind(direction.as_str())
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|row| row.record).collect())
}

/// Field sums of this session's outgoing capture, keyed by record.
pub async fn captured_sums(pool: &PgPool, session_id: SessionId) -> Result<HashMap<RecordKey, Option<i64>>> {
    let rows: Vec<(String, String, Option<i64>)> = sqlx::query_as(
        r#"
        SELECT record_type, record_id, updated_at_by_field_sum
        FROM sync_session_records
        WHERE session_id = $1 AND direction = $2
        "#,
    )
    .bind(session_id)
    .bind(Direction::Outgoing.as_str())
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(record_type, record_id, sum)| ((record_type, record_id), sum))
        .collect())
}

/// Delete one direction, or both when `direction` is `None`.
pub async fn delete_staging(
    pool: &PgPool,
    session_id: SessionId,
    direction: Option<Direction>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM sync_session_records
        WHERE session_id = $1 AND ($2::text IS NULL OR direction = $2)
        "#,
    )
    .bind(session_id)
    .bind(direction.map(|d| d.as_str()))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Drop outgoing rows that are unchanged copies of what this session just
/// received.
pub async fn remove_echoes(pool: &PgPool, session_id: SessionId) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM sync_session_records o
        USING sync_session_records i
        WHERE o.session_id = $1 AND o.direction = $2
          AND i.session_id = $1 AND i.direction = $3
          AND o.record_type = i.record_type AND o.record_id = i.record_id
          AND o.updated_at_by_field_sum = i.updated_at_by_field_sum
        "#,
    )
    .bind(session_id)
    .bind(Direction::Outgoing.as_str())
    .bind(Direction::Incoming.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
