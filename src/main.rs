use std::sync::Arc;

use anyhow::Result;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use floorcast::api::{create_timeline_router, create_ws_router, TimelineAppState, WsAppState};
use floorcast::bus::EventBus;
use floorcast::config::Config;
use floorcast::filter::EntityBlockList;
use floorcast::ingest::IngestionEngine;
use floorcast::registry::RegistryCache;
use floorcast::session::SessionManager;
use floorcast::snapshot::{SnapshotManager, SnapshotPolicy};
use floorcast::state::StateReconstructor;
use floorcast::store::{Database, EventStore, SnapshotStore};
use floorcast::upstream::supervisor::{run_supervisor, UpstreamConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let config = Config::from_env()?;
    init_tracing(&config);

    info!("floorcast starting");

    // Storage: one SQLite file shared by both stores
    let db = Database::open(&config.db_uri)?;
    info!(db_uri = %config.db_uri, "connected to event database");
    let events = Arc::new(EventStore::new(db.clone()));
    let snapshots = Arc::new(SnapshotStore::new(db));

    let bus = EventBus::new();
    let reconstructor = Arc::new(StateReconstructor::new(
        Arc::clone(&events),
        Arc::clone(&snapshots),
    ));

    // Registry cache refreshes on every upstream reconnect
    let registry_cache = Arc::new(RegistryCache::new());
    let _registry_subscription = registry_cache.attach(&bus);

    // Snapshot manager seeds its cache from current state, then follows the bus
    let policy = SnapshotPolicy::elapsed_time(config.snapshot_interval_seconds as i64);
    let snapshot_manager = SnapshotManager::new(
        Arc::clone(&snapshots),
        Arc::clone(&reconstructor),
        policy,
    );
    snapshot_manager.initialize(&bus)?;
    let _snapshot_subscription = snapshot_manager.attach(&bus);
    info!("snapshot manager initialized");

    // Subscriber sessions
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&reconstructor),
        Arc::clone(&registry_cache),
    ));
    let _session_subscription = sessions.attach(&bus);

    // Ingestion pipeline behind the reconnect supervisor (background task)
    let blocklist = EntityBlockList::new(&config.entity_blocklist)?;
    let engine = Arc::new(IngestionEngine::new(
        Arc::clone(&events),
        Arc::clone(&bus),
        blocklist,
    ));
    let upstream_config = UpstreamConfig {
        url: config.ha_websocket_url.clone(),
        token: config.ha_websocket_token.clone(),
    };
    let supervisor_bus = Arc::clone(&bus);
    tokio::spawn(async move {
        run_supervisor(upstream_config, supervisor_bus, engine).await;
    });
    info!("upstream supervisor started");

    // HTTP server: subscriber WebSocket + timeline endpoint
    let ws_router = create_ws_router(Arc::new(WsAppState { sessions }));
    let timeline_router = create_timeline_router(Arc::new(TimelineAppState {
        reconstructor,
        events,
    }));

    // CORS: the floor-plan frontend fetches timelines cross-origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    let app = ws_router.merge(timeline_router).layer(cors);

    let addr = "0.0.0.0:8000";
    info!("starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("floorcast={}", config.log_level).into());

    if config.log_to_console {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    }
}
