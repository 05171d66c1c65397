//! In-process [`SyncStore`] used by the tests and local tooling.
//!
//! Tables are keyed by table name. Every write goes through the same stamping
//! the database trigger does: the row gets the current clock value and each
//! changed column is recorded in its field-update map.

use super::{ChangeQuery, LiveRow, RecordKey, SyncStore};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldsync_engine::{
    Direction, DirectiveRegistry, ModelSyncDirective, NewSessionRecord, RecordId, RecordType,
    ScopeFilter, SessionId, StagingKey, SyncClock, SyncSession, SyncSessionRecord, Tick, TickTock,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

const PATIENT_FACILITIES: &str = "patient_facilities";

#[derive(Debug, Clone)]
struct MemoryRow {
    data: Map<String, Value>,
    updated_at_sync_tick: Tick,
    updated_at_by_field: BTreeMap<String, Tick>,
    deleted: bool,
}

impl MemoryRow {
    fn field_sum(&self) -> Option<i64> {
        if self.updated_at_by_field.is_empty() {
            None
        } else {
            Some(self.updated_at_by_field.values().sum())
        }
    }

    fn to_live(&self, id: &str) -> LiveRow {
        LiveRow {
            id: id.to_string(),
            is_deleted: self.deleted,
            data: self.data.clone(),
            updated_at_sync_tick: self.updated_at_sync_tick,
            updated_at_by_field_sum: self.field_sum(),
        }
    }
}

#[derive(Default)]
struct Inner {
    clock: SyncClock,
    sessions: HashMap<SessionId, SyncSession>,
    tables: HashMap<String, BTreeMap<RecordId, MemoryRow>>,
    staging: Vec<SyncSessionRecord>,
    next_staging_id: i64,
    cursors: HashMap<Direction, Tick>,
    settings: HashMap<(Option<String>, String), Value>,
}

impl Inner {
    /// Write a row the way the table trigger would.
    fn write(&mut self, table: &str, id: &str, data: Map<String, Value>, deleted: bool) {
        let tick = self.clock.current();
        let rows = self.tables.entry(table.to_string()).or_default();
        let row = rows.entry(id.to_string()).or_insert_with(|| MemoryRow {
            data: Map::new(),
            updated_at_sync_tick: tick,
            updated_at_by_field: BTreeMap::new(),
            deleted: false,
        });
        for (key, value) in data {
            if row.data.get(&key) != Some(&value) {
                row.updated_at_by_field.insert(key.clone(), tick);
                row.data.insert(key, value);
            }
        }
        row.data.insert("id".into(), Value::String(id.to_string()));
        if row.deleted != deleted {
            row.updated_at_by_field.insert("deleted_at".into(), tick);
        }
        row.deleted = deleted;
        row.updated_at_sync_tick = tick;
    }

    fn matches(&self, registry: &DirectiveRegistry, filter: &ScopeFilter, row: &MemoryRow) -> Result<bool> {
        Ok(match filter {
            ScopeFilter::FieldIn { field, values } => field_in(&row.data, field, values),
            ScopeFilter::Related {
                field,
                via_type,
                via_field,
                values,
            } => {
                let via = registry.get(via_type)?;
                let target = row.data.get(field).and_then(Value::as_str);
                target
                    .and_then(|id| self.tables.get(&via.table)?.get(id))
                    .is_some_and(|related| field_in(&related.data, via_field, values))
            }
            ScopeFilter::Any { filters } => {
                for inner in filters {
                    if self.matches(registry, inner, row)? {
                        return Ok(true);
                    }
                }
                false
            }
            ScopeFilter::All { filters } => {
                for inner in filters {
                    if !self.matches(registry, inner, row)? {
                        return Ok(false);
                    }
                }
                true
            }
        })
    }

    fn changed(&self, query: &ChangeQuery<'_>) -> Result<Vec<LiveRow>> {
        let Some(rows) = self.tables.get(&query.directive.table) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (id, row) in rows {
            if row.updated_at_sync_tick < query.since {
                continue;
            }
            if let Some(filter) = query.filter {
                if !self.matches(query.registry, filter, row)? {
                    continue;
                }
            }
            out.push(row.to_live(id));
        }
        Ok(out)
    }
}

fn field_in(data: &Map<String, Value>, field: &str, values: &[String]) -> bool {
    data.get(field)
        .and_then(Value::as_str)
        .is_some_and(|v| values.iter().any(|candidate| candidate == v))
}

/// A [`SyncStore`] held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a live row, stamped with the current tick.
    pub fn write_row(&self, table: &str, data: Value) {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.inner.lock().write(table, &id, data, false);
    }

    /// Soft-delete a live row.
    pub fn delete_row(&self, table: &str, id: &str) {
        self.inner.lock().write(table, id, Map::new(), true);
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Map<String, Value>> {
        let inner = self.inner.lock();
        inner.tables.get(table)?.get(id).map(|row| row.data.clone())
    }

    pub fn is_deleted(&self, table: &str, id: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .tables
            .get(table)
            .and_then(|rows| rows.get(id))
            .is_some_and(|row| row.deleted)
    }

    /// Link a patient to a facility.
    pub fn link_patient(&self, facility_id: &str, patient_id: &str) {
        self.write_row(
            PATIENT_FACILITIES,
            serde_json::json!({
                "id": format!("{patient_id};{facility_id}"),
                "patient_id": patient_id,
                "facility_id": facility_id,
            }),
        );
    }

    pub fn set_setting(&self, facility_id: Option<&str>, key: &str, value: Value) {
        self.inner
            .lock()
            .settings
            .insert((facility_id.map(str::to_string), key.to_string()), value);
    }

    pub fn staging_len(&self) -> usize {
        self.inner.lock().staging.len()
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn tick_tock(&self) -> Result<TickTock> {
        Ok(self.inner.lock().clock.tick_tock())
    }

    async fn insert_session(&self, session: &SyncSession) -> Result<()> {
        self.inner.lock().sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<SyncSession>> {
        Ok(self.inner.lock().sessions.get(&id).cloned())
    }

    async fn update_session(&self, session: &SyncSession) -> Result<()> {
        self.inner.lock().sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn touch_session(&self, id: SessionId, at: DateTime<Utc>) -> Result<()> {
        if let Some(session) = self.inner.lock().sessions.get_mut(&id) {
            session.touch(at);
        }
        Ok(())
    }

    async fn complete_snapshot(&self, id: SessionId, at: DateTime<Utc>) -> Result<bool> {
        match self.inner.lock().sessions.get_mut(&id) {
            Some(session) if !session.is_closed() => {
                session.snapshot_completed_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn lapsed_sessions(&self, before: DateTime<Utc>) -> Result<Vec<SessionId>> {
        Ok(self
            .inner
            .lock()
            .sessions
            .values()
            .filter(|s| !s.is_closed() && s.completed_at.is_none() && s.last_connection_time < before)
            .map(|s| s.id)
            .collect())
    }

    async fn count_changed(&self, query: &ChangeQuery<'_>) -> Result<i64> {
        Ok(self.inner.lock().changed(query)?.len() as i64)
    }

    async fn fetch_changed(
        &self,
        query: &ChangeQuery<'_>,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<LiveRow>> {
        let rows = self.inner.lock().changed(query)?;
        Ok(rows
            .into_iter()
            .filter(|row| after.map_or(true, |after| row.id.as_str() > after))
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn current_field_sums(
        &self,
        directive: &ModelSyncDirective,
        ids: &[RecordId],
    ) -> Result<HashMap<RecordId, Option<i64>>> {
        let inner = self.inner.lock();
        let Some(rows) = inner.tables.get(&directive.table) else {
            return Ok(HashMap::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| rows.get(id).map(|row| (id.clone(), row.field_sum())))
            .collect())
    }

    async fn persist_incoming(
        &self,
        registry: &DirectiveRegistry,
        session_id: SessionId,
        records: &[SyncSessionRecord],
        tock: Tick,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        // resolve every table first so a bad record leaves nothing half written
        let tables = records
            .iter()
            .map(|r| registry.get(&r.record_type).map(|d| d.table.clone()))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        inner.clock.merge(tock);
        for (record, table) in records.iter().zip(&tables) {
            inner.write(table, &record.record_id, record.data.clone(), record.is_deleted);
        }

        let sums: HashMap<RecordKey, Option<i64>> = records
            .iter()
            .zip(&tables)
            .map(|(r, table)| {
                let sum = inner
                    .tables
                    .get(table)
                    .and_then(|rows| rows.get(&r.record_id))
                    .and_then(MemoryRow::field_sum);
                ((r.record_type.clone(), r.record_id.clone()), sum)
            })
            .collect();
        for staged in inner.staging.iter_mut().filter(|s| {
            s.session_id == session_id && s.direction == Direction::Incoming
        }) {
            if let Some(sum) = sums.get(&(staged.record_type.clone(), staged.record_id.clone())) {
                staged.saved_at_sync_tick = Some(tock);
                staged.updated_at_by_field_sum = *sum;
            }
        }
        Ok(())
    }

    async fn insert_staging(&self, records: Vec<NewSessionRecord>) -> Result<()> {
        let mut inner = self.inner.lock();
        for record in records {
            inner.next_staging_id += 1;
            let id = inner.next_staging_id;
            inner.staging.push(record.into_record(id));
        }
        Ok(())
    }

    async fn count_staging(&self, session_id: SessionId, direction: Direction) -> Result<i64> {
        Ok(self
            .inner
            .lock()
            .staging
            .iter()
            .filter(|s| s.session_id == session_id && s.direction == direction)
            .count() as i64)
    }

    async fn fetch_staging_page(
        &self,
        session_id: SessionId,
        direction: Direction,
        type_order: &[RecordType],
        after: Option<StagingKey>,
        limit: i64,
    ) -> Result<Vec<(StagingKey, SyncSessionRecord)>> {
        let inner = self.inner.lock();
        let mut page: Vec<(StagingKey, SyncSessionRecord)> = inner
            .staging
            .iter()
            .filter(|s| s.session_id == session_id && s.direction == direction)
            .filter_map(|s| {
                let rank = type_order.iter().position(|t| *t == s.record_type)? as i32;
                let key = StagingKey { rank, id: s.id };
                after.is_none_or(|a| key > a).then(|| (key, s.clone()))
            })
            .collect();
        page.sort_by_key(|(key, _)| *key);
        page.truncate(limit.max(0) as usize);
        Ok(page)
    }

    async fn fetch_staging(
        &self,
        session_id: SessionId,
        direction: Direction,
    ) -> Result<Vec<SyncSessionRecord>> {
        Ok(self
            .inner
            .lock()
            .staging
            .iter()
            .filter(|s| s.session_id == session_id && s.direction == direction)
            .cloned()
            .collect())
    }

    async fn captured_sums(&self, session_id: SessionId) -> Result<HashMap<RecordKey, Option<i64>>> {
        Ok(self
            .inner
            .lock()
            .staging
            .iter()
            .filter(|s| s.session_id == session_id && s.direction == Direction::Outgoing)
            .map(|s| ((s.record_type.clone(), s.record_id.clone()), s.updated_at_by_field_sum))
            .collect())
    }

    async fn delete_staging(&self, session_id: SessionId, direction: Option<Direction>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.staging.len();
        inner.staging.retain(|s| {
            s.session_id != session_id || direction.is_some_and(|d| d != s.direction)
        });
        Ok((before - inner.staging.len()) as u64)
    }

    async fn remove_echoes(&self, session_id: SessionId) -> Result<u64> {
        let mut inner = self.inner.lock();
        let pushed: HashMap<RecordKey, i64> = inner
            .staging
            .iter()
            .filter(|s| s.session_id == session_id && s.direction == Direction::Incoming)
            .filter_map(|s| {
                s.updated_at_by_field_sum
                    .map(|sum| ((s.record_type.clone(), s.record_id.clone()), sum))
            })
            .collect();
        let before = inner.staging.len();
        inner.staging.retain(|s| {
            let echoed = s.session_id == session_id
                && s.direction == Direction::Outgoing
                && s.updated_at_by_field_sum.is_some()
                && pushed.get(&(s.record_type.clone(), s.record_id.clone())).copied()
                    == s.updated_at_by_field_sum;
            !echoed
        });
        Ok((before - inner.staging.len()) as u64)
    }

    async fn fetch_or_create_cursor(&self, direction: Direction) -> Result<Tick> {
        Ok(*self.inner.lock().cursors.entry(direction).or_insert(0))
    }

    async fn update_cursor(&self, direction: Direction, last_beat: Tick) -> Result<()> {
        self.inner.lock().cursors.insert(direction, last_beat);
        Ok(())
    }

    async fn facility_patients(&self, facility_id: &str) -> Result<Vec<(RecordId, Tick)>> {
        let inner = self.inner.lock();
        let Some(rows) = inner.tables.get(PATIENT_FACILITIES) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .filter(|row| !row.deleted)
            .filter(|row| row.data.get("facility_id").and_then(Value::as_str) == Some(facility_id))
            .filter_map(|row| {
                let patient = row.data.get("patient_id")?.as_str()?;
                Some((patient.to_string(), row.updated_at_sync_tick))
            })
            .collect())
    }

    async fn setting(&self, facility_id: Option<&str>, key: &str) -> Result<Option<Value>> {
        let inner = self.inner.lock();
        let scoped = facility_id
            .and_then(|f| inner.settings.get(&(Some(f.to_string()), key.to_string())));
        Ok(scoped
            .or_else(|| inner.settings.get(&(None, key.to_string())))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_engine::{FieldDef, FieldType, ModelSchema, SyncDirection};
    use serde_json::json;
    use uuid::Uuid;

    fn registry() -> DirectiveRegistry {
        let encounter = ModelSyncDirective::new(
            "Encounter",
            "encounters",
            SyncDirection::Bidirectional,
            ModelSchema::new(vec![
                FieldDef::new("id", FieldType::String),
                FieldDef::new("patient_id", FieldType::String),
            ]),
        );
        let lab_request = ModelSyncDirective::new(
            "LabRequest",
            "lab_requests",
            SyncDirection::Bidirectional,
            ModelSchema::new(vec![
                FieldDef::new("id", FieldType::String),
                FieldDef::new("encounter_id", FieldType::String),
            ]),
        );
        DirectiveRegistry::new(vec![encounter, lab_request]).unwrap()
    }

    #[tokio::test]
    async fn writes_are_stamped_per_field() {
        let store = MemoryStore::new();
        store.write_row("encounters", json!({"id": "e1", "patient_id": "p1"}));
        store.tick_tock().await.unwrap();
        store.write_row("encounters", json!({"id": "e1", "patient_id": "p2"}));

        let registry = registry();
        let directive = registry.get("Encounter").unwrap();
        let sums = store
            .current_field_sums(directive, &["e1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        // id stamped at 0, patient_id restamped at 2
        assert_eq!(sums.get("e1"), Some(&Some(2)));
        assert!(!sums.contains_key("missing"));
    }

    #[tokio::test]
    async fn deletes_are_soft_and_stamped() {
        let store = MemoryStore::new();
        store.write_row("encounters", json!({"id": "e1", "patient_id": "p1"}));
        let tt = store.tick_tock().await.unwrap();
        store.delete_row("encounters", "e1");

        assert!(store.is_deleted("encounters", "e1"));
        assert_eq!(store.row("encounters", "e1").unwrap()["patient_id"], "p1");

        let registry = registry();
        let query = ChangeQuery {
            registry: &registry,
            directive: registry.get("Encounter").unwrap(),
            since: tt.tock,
            filter: None,
        };
        let rows = store.fetch_changed(&query, None, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_deleted);
    }

    #[tokio::test]
    async fn related_filter_follows_the_foreign_key() {
        let store = MemoryStore::new();
        store.write_row("encounters", json!({"id": "e1", "patient_id": "p1"}));
        store.write_row("encounters", json!({"id": "e2", "patient_id": "p2"}));
        store.write_row("lab_requests", json!({"id": "l1", "encounter_id": "e1"}));
        store.write_row("lab_requests", json!({"id": "l2", "encounter_id": "e2"}));

        let registry = registry();
        let filter = ScopeFilter::related("encounter_id", "Encounter", "patient_id", &["p1".to_string()]);
        let query = ChangeQuery {
            registry: &registry,
            directive: registry.get("LabRequest").unwrap(),
            since: 0,
            filter: Some(&filter),
        };
        let rows = store.fetch_changed(&query, None, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "l1");
    }

    #[tokio::test]
    async fn staging_pages_follow_rank_then_id() {
        let store = MemoryStore::new();
        let session = Uuid::new_v4();
        let staged = |record_type: &str, id: &str| NewSessionRecord {
            session_id: session,
            direction: Direction::Outgoing,
            record_type: record_type.into(),
            record_id: id.into(),
            is_deleted: false,
            data: Map::new(),
            saved_at_sync_tick: None,
            updated_at_by_field_sum: None,
        };
        store
            .insert_staging(vec![staged("B", "b1"), staged("A", "a1"), staged("B", "b2"), staged("A", "a2")])
            .await
            .unwrap();

        let order = vec!["A".to_string(), "B".to_string()];
        let first = store
            .fetch_staging_page(session, Direction::Outgoing, &order, None, 3)
            .await
            .unwrap();
        let ids: Vec<_> = first.iter().map(|(_, r)| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2", "b1"]);

        let rest = store
            .fetch_staging_page(session, Direction::Outgoing, &order, Some(first[2].0), 3)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].1.record_id, "b2");
    }

    #[tokio::test]
    async fn settings_fall_back_to_deployment_value() {
        let store = MemoryStore::new();
        store.set_setting(None, "syncAllLabRequests", json!(false));
        store.set_setting(Some("f1"), "syncAllLabRequests", json!(true));

        assert_eq!(store.setting(Some("f1"), "syncAllLabRequests").await.unwrap(), Some(json!(true)));
        assert_eq!(store.setting(Some("f2"), "syncAllLabRequests").await.unwrap(), Some(json!(false)));
        assert_eq!(store.setting(None, "missing").await.unwrap(), None);
    }
}
