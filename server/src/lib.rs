//! FieldSync Server - central/facility sync over HTTP.
//!
//! Sessions, snapshots, paging and merges are driven by
//! [`session::SyncManager`] on top of a [`store::SyncStore`]. The binary wires
//! it to PostgreSQL; tests wire it to [`store::MemoryStore`].

pub mod auth;
pub mod catalog;
pub mod config;
pub mod cursor;
pub mod db;
pub mod error;
pub mod handlers;
pub mod merge;
pub mod routes;
pub mod session;
pub mod snapshot;
pub mod store;

use crate::config::Config;
use crate::session::SyncManager;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SyncManager>,
    pub config: Arc<Config>,
}

/// Build the HTTP application.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
