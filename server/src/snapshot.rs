//! Outgoing snapshots: copy changed live rows of one type into staging.

use crate::error::Result;
use crate::store::{ChangeQuery, SyncStore};
use fieldsync_engine::{
    sanitize, Direction, DirectiveRegistry, ModelSyncDirective, NewSessionRecord, SessionConfig,
    SessionId, Tick,
};

/// Snapshots record types for one session.
pub struct Snapshotter<'a> {
    store: &'a dyn SyncStore,
    registry: &'a DirectiveRegistry,
    session_id: SessionId,
    batch_size: i64,
}

impl<'a> Snapshotter<'a> {
    pub fn new(
        store: &'a dyn SyncStore,
        registry: &'a DirectiveRegistry,
        session_id: SessionId,
        batch_size: i64,
    ) -> Self {
        Self {
            store,
            registry,
            session_id,
            batch_size: batch_size.max(1),
        }
    }

    /// Stage every row of `directive` changed at or after `since`.
    ///
    /// `scope` of `None` means unscoped. An explicit empty scope for a type
    /// whose filter applies under `config` stages nothing without touching
    /// the store. Returns the number of rows staged.
    pub async fn snapshot_type(
        &self,
        directive: &ModelSyncDirective,
        since: Tick,
        scope: Option<&[String]>,
        config: &SessionConfig,
    ) -> Result<i64> {
        let filter = match scope {
            None => None,
            Some(ids) => match directive.build_sync_filter(ids, config) {
                Some(_) if ids.is_empty() => return Ok(0),
                built => built,
            },
        };
        let query = ChangeQuery {
            registry: self.registry,
            directive,
            since,
            filter: filter.as_ref(),
        };

        let count = self.store.count_changed(&query).await?;
        if count == 0 {
            return Ok(0);
        }

        // keyset paging: rows written meanwhile can join the capture but never
        // push an older row out of it
        let mut staged = 0;
        let mut after: Option<String> = None;
        loop {
            let rows = self
                .store
                .fetch_changed(&query, after.as_deref(), self.batch_size)
                .await?;
            let full = rows.len() as i64 == self.batch_size;
            after = rows.last().map(|row| row.id.clone());
            let records = rows
                .into_iter()
                .map(|row| -> Result<NewSessionRecord> {
                    Ok(NewSessionRecord {
                        session_id: self.session_id,
                        direction: Direction::Outgoing,
                        record_type: directive.name.clone(),
                        record_id: row.id,
                        is_deleted: row.is_deleted,
                        data: sanitize(&row.data, &directive.schema)?,
                        saved_at_sync_tick: None,
                        updated_at_by_field_sum: row.updated_at_by_field_sum,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            staged += records.len() as i64;
            if !records.is_empty() {
                self.store.insert_staging(records).await?;
            }
            if !full {
                break;
            }
        }

        tracing::debug!(
            session_id = %self.session_id,
            record_type = %directive.name,
            since,
            counted = count,
            staged,
            "Snapshotted record type"
        );
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LiveRow, MemoryStore, RecordKey};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use fieldsync_engine::{
        FieldDef, FieldType, ModelSchema, RecordId, RecordType, ScopeFilter, StagingKey,
        SyncDirection, SyncSession, SyncSessionRecord, TickTock,
    };
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    fn issue_registry() -> DirectiveRegistry {
        let issue = ModelSyncDirective::new(
            "PatientIssue",
            "patient_issues",
            SyncDirection::Bidirectional,
            ModelSchema::new(vec![
                FieldDef::new("id", FieldType::String),
                FieldDef::new("patient_id", FieldType::String),
                FieldDef::new("recorded_date", FieldType::DateTimeString),
                FieldDef::new("updated_at_sync_tick", FieldType::Int),
            ]),
        )
        .with_sync_filter(|ids, _| Some(ScopeFilter::field_in("patient_id", ids)));
        DirectiveRegistry::new(vec![issue]).unwrap()
    }

    fn seed(store: &MemoryStore, count: usize) {
        for i in 0..count {
            store.write_row(
                "patient_issues",
                json!({
                    "id": format!("issue-{i:03}"),
                    "patient_id": if i % 2 == 0 { "p1" } else { "p2" },
                    "recorded_date": "2024-03-01T08:15:00.000Z",
                }),
            );
        }
    }

    #[tokio::test]
    async fn stages_in_batches_and_sanitizes() {
        let store = MemoryStore::new();
        seed(&store, 7);
        let registry = issue_registry();
        let session = Uuid::new_v4();
        let snapshotter = Snapshotter::new(&store, &registry, session, 3);

        let directive = registry.get("PatientIssue").unwrap();
        let staged = snapshotter
            .snapshot_type(directive, 0, None, &SessionConfig::default())
            .await
            .unwrap();
        assert_eq!(staged, 7);

        let records = store.fetch_staging(session, Direction::Outgoing).await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.record_id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted, "staging ids follow primary id order");
        assert_eq!(records[0].data["recorded_date"], "2024-03-01 08:15:00");
        assert!(!records[0].data.contains_key("updated_at_sync_tick"));
    }

    #[tokio::test]
    async fn scope_restricts_and_empty_scope_short_circuits() {
        let store = MemoryStore::new();
        seed(&store, 6);
        let registry = issue_registry();
        let directive = registry.get("PatientIssue").unwrap();
        let config = SessionConfig::default();

        let scoped = Snapshotter::new(&store, &registry, Uuid::new_v4(), 100);
        let p1 = vec!["p1".to_string()];
        assert_eq!(scoped.snapshot_type(directive, 0, Some(p1.as_slice()), &config).await.unwrap(), 3);

        let empty = Snapshotter::new(&store, &registry, Uuid::new_v4(), 100);
        assert_eq!(empty.snapshot_type(directive, 0, Some(&[][..]), &config).await.unwrap(), 0);
        assert_eq!(store.staging_len(), 3);
    }

    #[tokio::test]
    async fn watermark_is_inclusive() {
        let store = MemoryStore::new();
        seed(&store, 2);
        let tt = store.tick_tock().await.unwrap();
        store.write_row("patient_issues", json!({"id": "late", "patient_id": "p1"}));

        let registry = issue_registry();
        let directive = registry.get("PatientIssue").unwrap();
        let snapshotter = Snapshotter::new(&store, &registry, Uuid::new_v4(), 100);
        let staged = snapshotter
            .snapshot_type(directive, tt.tock, None, &SessionConfig::default())
            .await
            .unwrap();
        assert_eq!(staged, 1);
    }

    /// Writes one extra issue, sorting before the rest, on the first read.
    struct WritesDuringRead {
        inner: MemoryStore,
        written: AtomicBool,
    }

    #[async_trait]
    impl SyncStore for WritesDuringRead {
        async fn tick_tock(&self) -> Result<TickTock> {
            self.inner.tick_tock().await
        }
        async fn insert_session(&self, session: &SyncSession) -> Result<()> {
            self.inner.insert_session(session).await
        }
        async fn get_session(&self, id: SessionId) -> Result<Option<SyncSession>> {
            self.inner.get_session(id).await
        }
        async fn update_session(&self, session: &SyncSession) -> Result<()> {
            self.inner.update_session(session).await
        }
        async fn touch_session(&self, id: SessionId, at: DateTime<Utc>) -> Result<()> {
            self.inner.touch_session(id, at).await
        }
        async fn complete_snapshot(&self, id: SessionId, at: DateTime<Utc>) -> Result<bool> {
            self.inner.complete_snapshot(id, at).await
        }
        async fn lapsed_sessions(&self, before: DateTime<Utc>) -> Result<Vec<SessionId>> {
            self.inner.lapsed_sessions(before).await
        }
        async fn count_changed(&self, query: &ChangeQuery<'_>) -> Result<i64> {
            self.inner.count_changed(query).await
        }
        async fn fetch_changed(
            &self,
            query: &ChangeQuery<'_>,
            after: Option<&str>,
            limit: i64,
        ) -> Result<Vec<LiveRow>> {
            if !self.written.swap(true, Ordering::SeqCst) {
                self.inner.write_row(
                    "patient_issues",
                    json!({"id": "issue-000a", "patient_id": "p1"}),
                );
            }
            self.inner.fetch_changed(query, after, limit).await
        }
        async fn current_field_sums(
            &self,
            directive: &ModelSyncDirective,
            ids: &[RecordId],
        ) -> Result<HashMap<RecordId, Option<i64>>> {
            self.inner.current_field_sums(directive, ids).await
        }
        async fn persist_incoming(
            &self,
            registry: &DirectiveRegistry,
            session_id: SessionId,
            records: &[SyncSessionRecord],
            tock: Tick,
        ) -> Result<()> {
            self.inner.persist_incoming(registry, session_id, records, tock).await
        }
        async fn insert_staging(&self, records: Vec<NewSessionRecord>) -> Result<()> {
            self.inner.insert_staging(records).await
        }
        async fn count_staging(&self, session_id: SessionId, direction: Direction) -> Result<i64> {
            self.inner.count_staging(session_id, direction).await
        }
        async fn fetch_staging_page(
            &self,
            session_id: SessionId,
            direction: Direction,
            type_order: &[RecordType],
            after: Option<StagingKey>,
            limit: i64,
        ) -> Result<Vec<(StagingKey, SyncSessionRecord)>> {
            self.inner
                .fetch_staging_page(session_id, direction, type_order, after, limit)
                .await
        }
        async fn fetch_staging(
            &self,
            session_id: SessionId,
            direction: Direction,
        ) -> Result<Vec<SyncSessionRecord>> {
            self.inner.fetch_staging(session_id, direction).await
        }
        async fn captured_sums(&self, session_id: SessionId) -> Result<HashMap<RecordKey, Option<i64>>> {
            self.inner.captured_sums(session_id).await
        }
        async fn delete_staging(&self, session_id: SessionId, direction: Option<Direction>) -> Result<u64> {
            self.inner.delete_staging(session_id, direction).await
        }
        async fn remove_echoes(&self, session_id: SessionId) -> Result<u64> {
            self.inner.remove_echoes(session_id).await
        }
        async fn fetch_or_create_cursor(&self, direction: Direction) -> Result<Tick> {
            self.inner.fetch_or_create_cursor(direction).await
        }
        async fn update_cursor(&self, direction: Direction, last_beat: Tick) -> Result<()> {
            self.inner.update_cursor(direction, last_beat).await
        }
        async fn facility_patients(&self, facility_id: &str) -> Result<Vec<(RecordId, Tick)>> {
            self.inner.facility_patients(facility_id).await
        }
        async fn setting(&self, facility_id: Option<&str>, key: &str) -> Result<Option<serde_json::Value>> {
            self.inner.setting(facility_id, key).await
        }
    }

    #[tokio::test]
    async fn rows_written_mid_snapshot_never_displace_older_rows() {
        let inner = MemoryStore::new();
        seed(&inner, 4);
        let store = WritesDuringRead {
            inner,
            written: AtomicBool::new(false),
        };
        let registry = issue_registry();
        let directive = registry.get("PatientIssue").unwrap();
        let session = Uuid::new_v4();
        let snapshotter = Snapshotter::new(&store, &registry, session, 2);

        let staged = snapshotter
            .snapshot_type(directive, 0, None, &SessionConfig::default())
            .await
            .unwrap();
        assert_eq!(staged, 5);

        let records = store.fetch_staging(session, Direction::Outgoing).await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["issue-000", "issue-000a", "issue-001", "issue-002", "issue-003"]
        );
    }
}
