//! Staging records: transport-ready snapshots of single rows.

use crate::{RecordId, RecordType, SessionId, Tick};
use serde::{Deserialize, Serialize};

/// Which half of a session a staging record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Captured locally, to be sent to the peer.
    Outgoing,
    /// Received from the peer, to be merged locally.
    Incoming,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outgoing => "outgoing",
            Direction::Incoming => "incoming",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "outgoing" => Some(Direction::Outgoing),
            "incoming" => Some(Direction::Incoming),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row staged for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSessionRecord {
    /// Assigned by the staging store, increasing in insertion order.
    pub id: i64,
    pub session_id: SessionId,
    pub direction: Direction,
    pub record_type: RecordType,
    pub record_id: RecordId,
    pub is_deleted: bool,
    /// Sanitized field map.
    pub data: serde_json::Map<String, serde_json::Value>,
    /// Tick at which incoming rows were persisted locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at_sync_tick: Option<Tick>,
    /// Checksum over the row's field-level update ticks at capture time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at_by_field_sum: Option<i64>,
}

/// A staging record before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionRecord {
    pub session_id: SessionId,
    pub direction: Direction,
    pub record_type: RecordType,
    pub record_id: RecordId,
    pub is_deleted: bool,
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at_sync_tick: Option<Tick>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at_by_field_sum: Option<i64>,
}

impl NewSessionRecord {
    /// Attach the store-assigned id.
    pub fn into_record(self, id: i64) -> SyncSessionRecord {
        SyncSessionRecord {
            id,
            session_id: self.session_id,
            direction: self.direction,
            record_type: self.record_type,
            record_id: self.record_id,
            is_deleted: self.is_deleted,
            data: self.data,
            saved_at_sync_tick: self.saved_at_sync_tick,
            updated_at_by_field_sum: self.updated_at_by_field_sum,
        }
    }
}

/// A change as sent over the wire by a peer pushing to this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingChange {
    pub record_type: RecordType,
    pub record_id: RecordId,
    #[serde(default)]
    pub is_deleted: bool,
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub updated_at_by_field_sum: Option<i64>,
    /// Raw field-level update ticks; used to derive the checksum when the
    /// sender did not supply one.
    #[serde(default)]
    pub updated_at_by_field: Option<serde_json::Map<String, serde_json::Value>>,
}

impl IncomingChange {
    /// Convert into a staging record for `session_id`.
    pub fn into_staging(self, session_id: SessionId) -> NewSessionRecord {
        let sum = self.updated_at_by_field_sum.or_else(|| {
            self.updated_at_by_field
                .as_ref()
                .and_then(updated_at_by_field_sum)
        });
        NewSessionRecord {
            session_id,
            direction: Direction::Incoming,
            record_type: self.record_type,
            record_id: self.record_id,
            is_deleted: self.is_deleted,
            data: self.data,
            saved_at_sync_tick: None,
            updated_at_by_field_sum: sum,
        }
    }
}

/// Sum of the per-field update ticks. `None` for an empty map, matching a row
/// that has never been written through the tracked path.
pub fn updated_at_by_field_sum(map: &serde_json::Map<String, serde_json::Value>) -> Option<i64> {
    let mut ticks = map.values().filter_map(|v| v.as_i64()).peekable();
    ticks.peek()?;
    Some(ticks.sum())
}

/// Position of a staged row in transmission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingKey {
    /// Dependency rank of the record type.
    pub rank: i32,
    /// Staging row id.
    pub id: i64,
}
