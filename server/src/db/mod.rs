//! Database module for PostgreSQL persistence.

mod cursors;
mod pool;
mod records;
mod scope;
mod sessions;
mod staging;

pub use pool::*;

use crate::error::{AppError, Result};
use crate::store::{ChangeQuery, LiveRow, RecordKey, SyncStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldsync_engine::{
    Direction, DirectiveRegistry, ModelSyncDirective, NewSessionRecord, RecordId, RecordType,
    SessionId, StagingKey, SyncSession, SyncSessionRecord, Tick, TickTock,
};
use std::collections::HashMap;

/// Quote a table or column name. Names come from the directive catalog, but
/// they are spliced into SQL, so anything outside `[a-z0-9_]` is refused.
pub(crate) fn ident(name: &str) -> Result<String> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(AppError::Internal(format!("invalid SQL identifier '{name}'")));
    }
    Ok(format!("\"{name}\""))
}

/// [`SyncStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncStore for PgStore {
    async fn tick_tock(&self) -> Result<TickTock> {
        cursors::tick_tock(&self.pool).await
    }

    async fn insert_session(&self, session: &SyncSession) -> Result<()> {
        sessions::insert_session(&self.pool, session).await
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<SyncSession>> {
        sessions::get_session(&self.pool, id).await
    }

    async fn update_session(&self, session: &SyncSession) -> Result<()> {
        sessions::update_session(&self.pool, session).await
    }

    async fn touch_session(&self, id: SessionId, at: DateTime<Utc>) -> Result<()> {
        sessions::touch_session(&self.pool, id, at).await
    }

    async fn complete_snapshot(&self, id: SessionId, at: DateTime<Utc>) -> Result<bool> {
        sessions::complete_snapshot(&self.pool, id, at).await
    }

    async fn lapsed_sessions(&self, before: DateTime<Utc>) -> Result<Vec<SessionId>> {
        sessions::lapsed_sessions(&self.pool, before).await
    }

    async fn count_changed(&self, query: &ChangeQuery<'_>) -> Result<i64> {
        records::count_changed(&self.pool, query).await
    }

    async fn fetch_changed(
        &self,
        query: &ChangeQuery<'_>,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<LiveRow>> {
        records::fetch_changed(&self.pool, query, after, limit).await
    }

    async fn current_field_sums(
        &self,
        directive: &ModelSyncDirective,
        ids: &[RecordId],
    ) -> Result<HashMap<RecordId, Option<i64>>> {
        records::current_field_sums(&self.pool, directive, ids).await
    }

    async fn persist_incoming(
        &self,
        registry: &DirectiveRegistry,
        session_id: SessionId,
        records: &[SyncSessionRecord],
        tock: Tick,
    ) -> Result<()> {
        records::persist_incoming(&self.pool, registry, session_id, records, tock).await
    }

    async fn insert_staging(&self, records: Vec<NewSessionRecord>) -> Result<()> {
        staging::insert_staging(&self.pool, &records).await
    }

    async fn count_staging(&self, session_id: SessionId, direction: Direction) -> Result<i64> {
        staging::count_staging(&self.pool, session_id, direction).await
    }

    async fn fetch_staging_page(
        &self,
        session_id: SessionId,
        direction: Direction,
        type_order: &[RecordType],
        after: Option<StagingKey>,
        limit: i64,
    ) -> Result<Vec<(StagingKey, SyncSessionRecord)>> {
        staging::fetch_staging_page(&self.pool, session_id, direction, type_order, after, limit).await
    }

    async fn fetch_staging(
        &self,
        session_id: SessionId,
        direction: Direction,
    ) -> Result<Vec<SyncSessionRecord>> {
        staging::fetch_staging(&self.pool, session_id, direction).await
    }

    async fn captured_sums(&self, session_id: SessionId) -> Result<HashMap<RecordKey, Option<i64>>> {
        staging::captured_sums(&self.pool, session_id).await
    }

    async fn delete_staging(&self, session_id: SessionId, direction: Option<Direction>) -> Result<u64> {
        staging::delete_staging(&self.pool, session_id, direction).await
    }

    async fn remove_echoes(&self, session_id: SessionId) -> Result<u64> {
        staging::remove_echoes(&self.pool, session_id).await
    }

    async fn fetch_or_create_cursor(&self, direction: Direction) -> Result<Tick> {
        cursors::fetch_or_create_cursor(&self.pool, direction).await
    }

    async fn update_cursor(&self, direction: Direction, last_beat: Tick) -> Result<()> {
        cursors::update_cursor(&self.pool, direction, last_beat).await
    }

    async fn facility_patients(&self, facility_id: &str) -> Result<Vec<(RecordId, Tick)>> {
        scope::facility_patients(&self.pool, facility_id).await
    }

    async fn setting(&self, facility_id: Option<&str>, key: &str) -> Result<Option<serde_json::Value>> {
        scope::setting(&self.pool, facility_id, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted_or_refused() {
        assert_eq!(ident("patient_issues").unwrap(), "\"patient_issues\"");
        assert!(ident("patients; DROP TABLE patients").is_err());
        assert!(ident("Patients").is_err());
        assert!(ident("1st").is_err());
        assert!(ident("").is_err());
    }
}
