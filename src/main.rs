//! adselect - Ad selection and frequency control for a news publishing site.
//!
//! # API Endpoints
//!
//! - `POST /ads/select` - Select ads for a placement
//! - `POST /ads/track` - Record an impression or click
//! - `GET /health` - Health check

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use adselect::api::{AppState, router};
use adselect::cache::LocalSelectionCache;
use adselect::config::Config;
use adselect::selection::AdSelector;
use adselect::storage::Storage;

/// How often expired selections are swept from the cache.
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with environment filter
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("adselect=info".parse()?))
        .init();

    let config = Config::from_env()?;

    info!(
        port = config.port,
        db_url = %config.database_url,
        cache_ttl_secs = config.selection.cache_ttl.as_secs(),
        "Starting adselect server"
    );

    // Initialize storage
    let storage = Storage::new(&config.database_url).await?;
    info!("Database initialized");

    if let Some(path) = &config.inventory_path {
        storage.load_inventory(path).await?;
    }

    let cache = LocalSelectionCache::new(config.cache_max_entries);
    let sweeper = cache.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let evicted = sweeper.evict_expired();
            if evicted > 0 {
                debug!(evicted, remaining = sweeper.len(), "Selection cache swept");
            }
        }
    });

    let storage = Arc::new(storage);
    let selector = AdSelector::new(
        storage.clone(),
        storage,
        Arc::new(cache),
        config.selection.clone(),
    );

    // Build router
    let app = router(AppState { selector });

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "adselect is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
