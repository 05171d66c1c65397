//! Database operations on the live entity tables.
//!
//! Table and column names come from the directive catalog and are quoted with
//! [`ident`]; every value is bound.

use super::ident;
use crate::error::{AppError, Result};
use crate::store::{ChangeQuery, LiveRow};
use fieldsync_engine::{
    Direction, DirectiveRegistry, ModelSyncDirective, RecordId, ScopeFilter, SessionId,
    SyncSessionRecord, Tick,
};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::{BTreeMap, HashMap};

/// Checksum over the per-field update ticks of row `t`.
const FIELD_SUM: &str =
    "(SELECT SUM(f.value::bigint) FROM jsonb_each_text(t.updated_at_by_field) AS f)::bigint";

/// A live row as read for a snapshot.
#[derive(Debug)]
pub struct StoredLiveRow {
    pub id: String,
    pub data: serde_json::Value,
    pub is_deleted: bool,
    pub updated_at_sync_tick: i64,
    pub updated_at_by_field_sum: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredLiveRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(StoredLiveRow {
            id: row.try_get("id")?,
            data: row.try_get("data")?,
            is_deleted: row.try_get("is_deleted")?,
            updated_at_sync_tick: row.try_get("updated_at_sync_tick")?,
            updated_at_by_field_sum: row.try_get("updated_at_by_field_sum")?,
        })
    }
}

impl StoredLiveRow {
    fn into_live_row(self) -> Result<LiveRow> {
        let serde_json::Value::Object(data) = self.data else {
            return Err(AppError::Internal(format!("row '{}' is not a JSON object", self.id)));
        };
        Ok(LiveRow {
            id: self.id,
            is_deleted: self.is_deleted,
            data,
            updated_at_sync_tick: self.updated_at_sync_tick,
            updated_at_by_field_sum: self.updated_at_by_field_sum,
        })
    }
}

/// Append `filter` as a boolean SQL expression over the row alias `t`.
fn push_filter(
    qb: &mut QueryBuilder<'_, Postgres>,
    registry: &DirectiveRegistry,
    filter: &ScopeFilter,
) -> Result<()> {
    match filter {
        ScopeFilter::FieldIn { field, values } => {
            qb.push(format!("t.{} = ANY(", ident(field)?));
            qb.push_bind(values.clone());
            qb.push(")");
        }
        ScopeFilter::Related {
            field,
            via_type,
            via_field,
            values,
        } => {
            let via_table = &registry.get(via_type)?.table;
            qb.push(format!(
                "t.{} IN (SELECT r.id FROM {} r WHERE r.{} = ANY(",
                ident(field)?,
                ident(via_table)?,
                ident(via_field)?,
            ));
            qb.push_bind(values.clone());
            qb.push("))");
        }
        ScopeFilter::Any { filters } => push_group(qb, registry, filters, " OR ", "FALSE")?,
        ScopeFilter::All { filters } => push_group(qb, registry, filters, " AND ", "TRUE")?,
    }
    Ok(())
}

fn push_group(
    qb: &mut QueryBuilder<'_, Postgres>,
    registry: &DirectiveRegistry,
    filters: &[ScopeFilter],
    separator: &str,
    empty: &str,
) -> Result<()> {
    if filters.is_empty() {
        qb.push(empty);
        return Ok(());
    }
    qb.push("(");
    for (i, inner) in filters.iter().enumerate() {
        if i > 0 {
            qb.push(separator);
        }
        push_filter(qb, registry, inner)?;
    }
    qb.push(")");
    Ok(())
}

fn push_changed_where(qb: &mut QueryBuilder<'_, Postgres>, query: &ChangeQuery<'_>) -> Result<()> {
    qb.push(" WHERE t.updated_at_sync_tick >= ");
    qb.push_bind(query.since);
    if let Some(filter) = query.filter {
        qb.push(" AND ");
        push_filter(qb, query.registry, filter)?;
    }
    Ok(())
}

pub async fn count_changed(pool: &PgPool, query: &ChangeQuery<'_>) -> Result<i64> {
    let mut qb = QueryBuilder::new(format!(
        "SELECT COUNT(*) FROM {} t",
        ident(&query.directive.table)?
    ));
    push_changed_where(&mut qb, query)?;
    let count: i64 = qb.build_query_scalar().fetch_one(pool).await?;
    Ok(count)
}

pub async fn fetch_changed(
    pool: &PgPool,
    query: &ChangeQuery<'_>,
    after: Option<&str>,
    limit: i64,
) -> Result<Vec<LiveRow>> {
    let mut qb = QueryBuilder::new(format!(
        "SELECT t.id, to_jsonb(t) AS data, t.deleted_at IS NOT NULL AS is_deleted, \
         t.updated_at_sync_tick, {FIELD_SUM} AS updated_at_by_field_sum FROM {} t",
        ident(&query.directive.table)?
    ));
    push_changed_where(&mut qb, query)?;
    if let Some(after) = after {
        qb.push(" AND t.id > ");
        qb.push_bind(after.to_string());
    }
    qb.push(" ORDER BY t.id LIMIT ");
    qb.push_bind(limit);

    qb.build_query_as::<StoredLiveRow>()
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(StoredLiveRow::into_live_row)
        .collect()
}

pub async fn current_field_sums(
    pool: &PgPool,
    directive: &ModelSyncDirective,
    ids: &[RecordId],
) -> Result<HashMap<RecordId, Option<i64>>> {
    let rows: Vec<(String, Option<i64>)> = sqlx::query_as(&format!(
        "SELECT t.id, {FIELD_SUM} FROM {} t WHERE t.id = ANY($1)",
        ident(&directive.table)?
    ))
    .bind(ids)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().collect())
}

/// Upsert every record into its table, then stamp the matching incoming
/// staging rows with `tock` and the resulting field sums, all in one
/// transaction. The stamped sums are what lets the next outgoing snapshot
/// recognise these rows as echoes.
pub async fn persist_incoming(
    pool: &PgPool,
    registry: &DirectiveRegistry,
    session_id: SessionId,
    records: &[SyncSessionRecord],
    tock: Tick,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let mut ids_by_type: BTreeMap<&str, (&str, Vec<&str>)> = BTreeMap::new();

    for record in records {
        let directive = registry.get(&record.record_type)?;
        let table = ident(&directive.table)?;

        let mut data = record.data.clone();
        data.insert("id".to_string(), serde_json::Value::String(record.record_id.clone()));
        let columns = data
            .keys()
            .map(|k| ident(k))
            .collect::<Result<Vec<_>>>()?;

        let selected: Vec<String> = columns.iter().map(|c| format!("r.{c}")).collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| c.as_str() != "\"id\"")
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();
        let mut sql = format!(
            "INSERT INTO {table} ({}, deleted_at) \
             SELECT {}, CASE WHEN $2 THEN now() ELSE NULL END \
             FROM jsonb_populate_record(NULL::{table}, $1) r \
             ON CONFLICT (id) DO UPDATE SET ",
            columns.join(", "),
            selected.join(", "),
        );
        for update in &updates {
            sql.push_str(update);
            sql.push_str(", ");
        }
        sql.push_str(&format!(
            "deleted_at = CASE WHEN $2 THEN COALESCE({table}.deleted_at, now()) ELSE NULL END"
        ));

        sqlx::query(&sql)
            .bind(serde_json::Value::Object(data))
            .bind(record.is_deleted)
            .execute(&mut *tx)
            .await?;

        ids_by_type
            .entry(record.record_type.as_str())
            .or_insert_with(|| (directive.table.as_str(), Vec::new()))
            .1
            .push(record.record_id.as_str());
    }

    for (record_type, (table, ids)) in ids_by_type {
        sqlx::query(&format!(
            r#"
            UPDATE sync_session_records s
            SET saved_at_sync_tick = $1, updated_at_by_field_sum = {FIELD_SUM}
            FROM {} t
            WHERE s.session_id = $2 AND s.direction = $3 AND s.record_type = $4
              AND s.record_id = t.id AND t.id = ANY($5)
            "#,
            ident(table)?
        ))
        .bind(tock)
        .bind(session_id)
        .bind(Direction::Incoming.as_str())
        .bind(record_type)
        .bind(&ids)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}
