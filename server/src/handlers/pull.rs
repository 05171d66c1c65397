//! Pull handlers: serve a session's outgoing snapshot.

use crate::error::{AppError, Result};
use crate::session::{PullFilter, PullPage, SyncManager};
use fieldsync_engine::{SessionId, StagingKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Query parameters for fetching a page.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullQuery {
    /// Position of the last record already received. Both or neither.
    pub after_rank: Option<i32>,
    pub after_id: Option<i64>,
    pub limit: Option<i64>,
}

impl PullQuery {
    fn after(&self) -> Result<Option<StagingKey>> {
        match (self.after_rank, self.after_id) {
            (Some(rank), Some(id)) => Ok(Some(StagingKey { rank, id })),
            (None, None) => Ok(None),
            _ => Err(AppError::BadRequest(
                "afterRank and afterId must be given together".to_string(),
            )),
        }
    }
}

/// Response for snapshot progress.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullCountResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
}

/// Response for pull initiation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullStartedResponse {
    pub session_id: SessionId,
}

pub async fn handle_initiate_pull(
    manager: &Arc<SyncManager>,
    id: SessionId,
    filter: PullFilter,
) -> Result<PullStartedResponse> {
    manager.initiate_pull(id, filter).await?;
    Ok(PullStartedResponse { session_id: id })
}

pub async fn handle_pull_count(manager: &SyncManager, id: SessionId) -> Result<PullCountResponse> {
    let count = manager.fetch_pull_count(id).await?;
    Ok(PullCountResponse {
        ready: count.is_some(),
        count,
    })
}

pub async fn handle_pull(manager: &SyncManager, id: SessionId, query: PullQuery) -> Result<PullPage> {
    manager.outgoing_page(id, query.after()?, query.limit).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_requires_both_halves() {
        let both = PullQuery {
            after_rank: Some(2),
            after_id: Some(40),
            limit: None,
        };
        assert_eq!(both.after().unwrap(), Some(StagingKey { rank: 2, id: 40 }));
        assert_eq!(PullQuery::default().after().unwrap(), None);

        let half = PullQuery {
            after_rank: Some(2),
            ..Default::default()
        };
        assert!(matches!(half.after(), Err(AppError::BadRequest(_))));
    }
}
