//! Push handlers: stage and merge changes from the peer.

use crate::error::Result;
use crate::session::SyncManager;
use fieldsync_engine::{IncomingChange, MergeReport, SessionId, Tick};
use serde::{Deserialize, Serialize};

/// Request body for a batch of incoming changes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub changes: Vec<IncomingChange>,
}

/// Response for a staged batch.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub staged: usize,
}

/// Request body for completing the push phase.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePushRequest {
    /// Peer tick the incoming cursor may advance to.
    #[serde(default)]
    pub up_to_tick: Option<Tick>,
}

pub async fn handle_push(manager: &SyncManager, id: SessionId, request: PushRequest) -> Result<PushResponse> {
    let staged = manager.add_incoming_changes(id, request.changes).await?;
    Ok(PushResponse { staged })
}

pub async fn handle_complete_push(
    manager: &SyncManager,
    id: SessionId,
    request: CompletePushRequest,
) -> Result<MergeReport> {
    manager.complete_push(id, request.up_to_tick).await
}
