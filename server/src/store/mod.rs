//! Storage abstraction for the sync server.
//!
//! Everything the session manager persists goes through [`SyncStore`]: the
//! sync clock, sessions, live entity rows, staging records, cursors and the
//! scope lookups. [`crate::db::PgStore`] is the production implementation;
//! [`MemoryStore`] backs the tests.

mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldsync_engine::{
    Direction, DirectiveRegistry, ModelSyncDirective, NewSessionRecord, RecordId, RecordType,
    ScopeFilter, SessionId, StagingKey, SyncSession, SyncSessionRecord, Tick, TickTock,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Shared handle to a store.
pub type SharedStore = Arc<dyn SyncStore>;

/// Rows of one type changed since a watermark, optionally scoped.
#[derive(Clone, Copy)]
pub struct ChangeQuery<'a> {
    /// Needed to resolve the tables behind related-row filters.
    pub registry: &'a DirectiveRegistry,
    pub directive: &'a ModelSyncDirective,
    pub since: Tick,
    pub filter: Option<&'a ScopeFilter>,
}

/// One live entity row as read for a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveRow {
    pub id: RecordId,
    pub is_deleted: bool,
    /// Every column of the row, bookkeeping included.
    pub data: serde_json::Map<String, serde_json::Value>,
    pub updated_at_sync_tick: Tick,
    pub updated_at_by_field_sum: Option<i64>,
}

/// Key identifying a record across types.
pub type RecordKey = (RecordType, RecordId);

#[async_trait]
pub trait SyncStore: Send + Sync + 'static {
    // Sync clock

    /// Advance the clock by two, returning both halves.
    async fn tick_tock(&self) -> Result<TickTock>;

    // Sessions

    async fn insert_session(&self, session: &SyncSession) -> Result<()>;
    async fn get_session(&self, id: SessionId) -> Result<Option<SyncSession>>;
    async fn update_session(&self, session: &SyncSession) -> Result<()>;
    /// Heartbeat: set only `last_connection_time`, leaving the rest of the
    /// row to whoever else is writing it.
    async fn touch_session(&self, id: SessionId, at: DateTime<Utc>) -> Result<()>;
    /// Stamp the snapshot of an open session as complete. Returns `false`,
    /// writing nothing, when the session is closed or missing.
    async fn complete_snapshot(&self, id: SessionId, at: DateTime<Utc>) -> Result<bool>;
    /// Open sessions whose last connection is older than `before`.
    async fn lapsed_sessions(&self, before: DateTime<Utc>) -> Result<Vec<SessionId>>;

    // Live rows

    async fn count_changed(&self, query: &ChangeQuery<'_>) -> Result<i64>;
    /// Up to `limit` changed rows with a primary id greater than `after`,
    /// ordered by id.
    async fn fetch_changed(
        &self,
        query: &ChangeQuery<'_>,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<LiveRow>>;
    /// Current field-update checksums of the given rows. Missing rows are
    /// absent from the result.
    async fn current_field_sums(
        &self,
        directive: &ModelSyncDirective,
        ids: &[RecordId],
    ) -> Result<HashMap<RecordId, Option<i64>>>;
    /// Upsert `records` into their tables in one transaction, then stamp the
    /// session's incoming staging rows with `tock` and the resulting local
    /// checksum.
    async fn persist_incoming(
        &self,
        registry: &DirectiveRegistry,
        session_id: SessionId,
        records: &[SyncSessionRecord],
        tock: Tick,
    ) -> Result<()>;

    // Staging

    async fn insert_staging(&self, records: Vec<NewSessionRecord>) -> Result<()>;
    async fn count_staging(&self, session_id: SessionId, direction: Direction) -> Result<i64>;
    /// Staged rows ordered by `(rank, id)`, where a type's rank is its index in
    /// `type_order`, starting strictly after `after`.
    async fn fetch_staging_page(
        &self,
        session_id: SessionId,
        direction: Direction,
        type_order: &[RecordType],
        after: Option<StagingKey>,
        limit: i64,
    ) -> Result<Vec<(StagingKey, SyncSessionRecord)>>;
    async fn fetch_staging(
        &self,
        session_id: SessionId,
        direction: Direction,
    ) -> Result<Vec<SyncSessionRecord>>;
    /// Checksums of the rows this node staged outgoing in the session.
    async fn captured_sums(&self, session_id: SessionId) -> Result<HashMap<RecordKey, Option<i64>>>;
    /// Delete staging rows of one direction, or of both when `None`.
    async fn delete_staging(&self, session_id: SessionId, direction: Option<Direction>) -> Result<u64>;
    /// Drop outgoing rows the peer pushed in this session with an identical
    /// checksum.
    async fn remove_echoes(&self, session_id: SessionId) -> Result<u64>;

    // Cursors

    /// Read the cursor for `direction`, creating it at zero if missing.
    async fn fetch_or_create_cursor(&self, direction: Direction) -> Result<Tick>;
    /// Unconditional write.
    async fn update_cursor(&self, direction: Direction, last_beat: Tick) -> Result<()>;

    // Scope

    /// Patients linked to a facility, with the tick each link was written at.
    async fn facility_patients(&self, facility_id: &str) -> Result<Vec<(RecordId, Tick)>>;
    /// A setting for a facility, falling back to the deployment-wide value
    /// when `facility_id` is `None` or has no override.
    async fn setting(&self, facility_id: Option<&str>, key: &str) -> Result<Option<serde_json::Value>>;
}
