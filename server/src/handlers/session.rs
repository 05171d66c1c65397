//! Session start, heartbeat and end.

use crate::error::Result;
use crate::session::SyncManager;
use chrono::{DateTime, Utc};
use fieldsync_engine::{SessionId, SessionStatus, SyncSession, Tick};
use serde::{Deserialize, Serialize};

/// Request body for starting a session.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    /// Free-form peer details kept on the session for diagnostics.
    #[serde(default)]
    pub debug_info: serde_json::Value,
}

/// Response for session start.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub session_id: SessionId,
    pub sync_tick: Tick,
}

/// What a peer sees of a session.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub sync_tick: Tick,
    pub start_time: DateTime<Utc>,
    pub last_connection_time: DateTime<Utc>,
    pub snapshot_completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<SyncSession> for SessionView {
    fn from(session: SyncSession) -> Self {
        SessionView {
            session_id: session.id,
            status: session.status,
            sync_tick: session.sync_tick,
            start_time: session.start_time,
            last_connection_time: session.last_connection_time,
            snapshot_completed: session.snapshot_completed_at.is_some(),
            completed_at: session.completed_at,
        }
    }
}

pub async fn handle_start(
    manager: &SyncManager,
    request: StartSessionRequest,
) -> Result<StartSessionResponse> {
    let session = manager.start_session(request.debug_info).await?;
    Ok(StartSessionResponse {
        session_id: session.id,
        sync_tick: session.sync_tick,
    })
}

pub async fn handle_connect(manager: &SyncManager, id: SessionId) -> Result<SessionView> {
    Ok(manager.connect(id).await?.into())
}

pub async fn handle_end(manager: &SyncManager, id: SessionId) -> Result<SessionView> {
    Ok(manager.end_session(id).await?.into())
}
