//! Sync endpoint routes.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use fieldsync_engine::{MergeReport, ResolvedChannel, SessionId};

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{
    handle_channels, handle_complete_push, handle_connect, handle_end, handle_initiate_pull,
    handle_pull, handle_pull_count, handle_push, handle_resolve_channel, handle_start,
    ChannelQuery, ChannelsResponse, CompletePushRequest, PullCountResponse, PullQuery,
    PullStartedResponse, PushRequest, PushResponse, SessionView, StartSessionRequest,
    StartSessionResponse,
};
use crate::session::{PullFilter, PullPage};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync", post(start_handler))
        .route("/sync/channel", get(resolve_channel_handler))
        .route("/sync/channels/{scope_id}", get(channels_handler))
        .route("/sync/{id}", get(connect_handler).delete(end_handler))
        .route("/sync/{id}/pull", get(pull_handler).post(initiate_pull_handler))
        .route("/sync/{id}/pull/count", get(pull_count_handler))
        .route("/sync/{id}/pull/complete", post(complete_pull_handler))
        .route("/sync/{id}/push", post(push_handler))
        .route("/sync/{id}/push/complete", post(complete_push_handler))
}

/// POST /sync - Start a session.
async fn start_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(request): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<StartSessionResponse>)> {
    let response = handle_start(&state.manager, request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /sync/{id} - Heartbeat.
async fn connect_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionView>> {
    Ok(Json(handle_connect(&state.manager, id).await?))
}

/// DELETE /sync/{id} - End a session.
async fn end_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionView>> {
    Ok(Json(handle_end(&state.manager, id).await?))
}

/// POST /sync/{id}/pull - Start the outgoing snapshot.
async fn initiate_pull_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<SessionId>,
    Json(filter): Json<PullFilter>,
) -> Result<(StatusCode, Json<PullStartedResponse>)> {
    let response = handle_initiate_pull(&state.manager, id, filter).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /sync/{id}/pull/count - Snapshot progress.
async fn pull_count_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<SessionId>,
) -> Result<Json<PullCountResponse>> {
    Ok(Json(handle_pull_count(&state.manager, id).await?))
}

/// GET /sync/{id}/pull - One page of the outgoing snapshot.
async fn pull_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<SessionId>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullPage>> {
    Ok(Json(handle_pull(&state.manager, id, query).await?))
}

/// POST /sync/{id}/pull/complete - Commit the outgoing phase.
async fn complete_pull_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionView>> {
    Ok(Json(state.manager.complete_pull(id).await?.into()))
}

/// POST /sync/{id}/push - Stage incoming changes.
async fn push_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<SessionId>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>> {
    Ok(Json(handle_push(&state.manager, id, request).await?))
}

/// POST /sync/{id}/push/complete - Merge staged changes.
async fn complete_push_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<SessionId>,
    Json(request): Json<CompletePushRequest>,
) -> Result<Json<MergeReport>> {
    Ok(Json(handle_complete_push(&state.manager, id, request).await?))
}

/// GET /sync/channels/{scope_id} - Channels a scope subscribes to.
async fn channels_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(scope_id): Path<String>,
) -> Result<Json<ChannelsResponse>> {
    Ok(Json(handle_channels(&state.manager, scope_id).await?))
}

/// GET /sync/channel?path= - Resolve a channel to its record type.
async fn resolve_channel_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<ChannelQuery>,
) -> Result<Json<ResolvedChannel>> {
    Ok(Json(handle_resolve_channel(&state.manager, &query)?))
}
