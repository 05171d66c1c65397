//! Channel lookups.

use crate::error::Result;
use crate::session::SyncManager;
use fieldsync_engine::ResolvedChannel;
use serde::{Deserialize, Serialize};

/// Response for a scope's channel set.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsResponse {
    pub scope_id: String,
    pub channels: Vec<String>,
}

/// Query parameters for resolving one channel.
#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    pub path: String,
}

pub async fn handle_channels(manager: &SyncManager, scope_id: String) -> Result<ChannelsResponse> {
    let channels = manager.channels_for_scope(&scope_id).await?;
    Ok(ChannelsResponse {
        scope_id,
        channels: channels.as_ref().clone(),
    })
}

pub fn handle_resolve_channel(manager: &SyncManager, query: &ChannelQuery) -> Result<ResolvedChannel> {
    manager.resolve_channel(&query.path)
}
