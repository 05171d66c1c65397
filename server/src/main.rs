//! FieldSync Server binary.

use fieldsync_server::catalog::default_registry;
use fieldsync_server::config::Config;
use fieldsync_server::db::{self, PgStore};
use fieldsync_server::session::SyncManager;
use fieldsync_server::store::SharedStore;
use fieldsync_server::{app, AppState};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fieldsync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        role = ?config.sync.node_role,
        "Starting FieldSync Server on {}:{}",
        config.host,
        config.port
    );

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;

    // Run migrations
    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;

    let store: SharedStore = Arc::new(PgStore::new(pool));
    let registry = default_registry(Arc::clone(&store))?;
    let manager = SyncManager::new(store, registry, config.sync.clone())?;
    manager.spawn_reaper();

    let state = AppState {
        manager,
        config: Arc::new(config.clone()),
    };

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app(state)).await?;

    Ok(())
}
