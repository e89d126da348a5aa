use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod bus;
mod cache;
mod config;
mod db;
mod enrich;
mod error;
mod geo;
mod handlers;
mod ids;
mod models;
mod redis_backend;
mod resolver;
mod stats;
mod store;
mod token;

use bus::{EventPublisher, EventSource};
use cache::{MappingCache, MemoryCache};
use db::SqliteStore;
use enrich::EventEnricher;
use geo::{GeoLocator, MaxMindLocator, NoGeoDatabase};
use ids::{CounterService, IdAllocator, MemoryCounter};
use redis_backend::{RedisCache, RedisConnector, RedisCounter, RedisStreamPublisher, RedisStreamSource};
use resolver::MappingResolver;
use stats::{StatsAggregator, StatsProcessor};

/// How long an idle consumer waits before polling the bus again.
const BUS_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Unconsumed events the in-process bus holds before publishes start failing.
const MEMORY_BUS_CAPACITY: usize = 10_000;

// ── Shared application state ───────────────────────────────────────────────

pub struct AppState {
    pub resolver: MappingResolver,
    pub publisher: Arc<dyn EventPublisher>,
    pub stats: StatsAggregator,
}

struct Backends {
    cache: Arc<dyn MappingCache>,
    counter: Arc<dyn CounterService>,
    publisher: Arc<dyn EventPublisher>,
    source: Arc<dyn EventSource>,
}

// ── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (ignore error if file is absent, env vars may already be set)
    dotenvy::dotenv().ok();

    // Initialise structured logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "linkstat=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::AppConfig::from_env()?;
    tracing::info!("Starting linkstat on {}:{}", config.host, config.port);

    let pool = db::connect(&config.database_url).await?;
    let store = Arc::new(SqliteStore::new(pool));

    let backends = match config.redis_url.as_deref() {
        Some(url) => redis_backends(url, &config).await?,
        None => {
            tracing::warn!("REDIS_URL not set, using in-process cache, counter and stats bus");
            let (publisher, source) = bus::memory_bus(BUS_POLL_INTERVAL, MEMORY_BUS_CAPACITY);
            Backends {
                cache: Arc::new(MemoryCache::new()),
                counter: Arc::new(MemoryCounter::new()),
                publisher: Arc::new(publisher),
                source: Arc::new(source),
            }
        }
    };

    // Must happen before the listener accepts anything
    let ids = IdAllocator::new(backends.counter, config.counter_key.clone(), store.as_ref()).await?;

    let locator: Arc<dyn GeoLocator> = match MaxMindLocator::open(&config.geoip_db_path) {
        Ok(locator) => {
            tracing::info!("Loaded GeoIP database from {}", config.geoip_db_path);
            Arc::new(locator)
        }
        Err(e) => {
            tracing::warn!(
                "Could not open GeoIP database at {}: {}. Locations will be recorded as Unknown",
                config.geoip_db_path,
                e
            );
            Arc::new(NoGeoDatabase)
        }
    };

    // ── Stats consumer ─────────────────────────────────────────────────────
    let processor = Arc::new(StatsProcessor::new(EventEnricher::new(locator), store.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = tokio::spawn(bus::run_consumer(backends.source, processor, shutdown_rx));

    let state = Arc::new(AppState {
        resolver: MappingResolver::new(store.clone(), backends.cache, Arc::new(ids)),
        publisher: backends.publisher,
        stats: StatsAggregator::new(store),
    });
    let app = handlers::router(state);

    // ── Serve ──────────────────────────────────────────────────────────────
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("HTTP server stopped, waiting for the stats consumer");
    // The receiver may already be gone if the consumer exited on its own
    let _ = shutdown_tx.send(true);
    if let Err(e) = consumer.await {
        tracing::error!("Stats consumer task failed: {}", e);
    }

    Ok(())
}

async fn redis_backends(url: &str, config: &config::AppConfig) -> anyhow::Result<Backends> {
    let connector = RedisConnector::connect(url).await?;
    tracing::info!("Connected to Redis");

    let source = RedisStreamSource::new(
        connector.clone(),
        config.stats_stream.clone(),
        config.stats_group.clone(),
        config.stats_consumer.clone(),
        BUS_POLL_INTERVAL,
    )
    .await?;
    tracing::info!(
        "Consuming '{}' as '{}' in group '{}'",
        config.stats_stream,
        config.stats_consumer,
        config.stats_group
    );

    Ok(Backends {
        cache: Arc::new(RedisCache::new(connector.clone(), config.cache_key_prefix.clone())),
        counter: Arc::new(RedisCounter::new(connector.clone())),
        publisher: Arc::new(RedisStreamPublisher::new(connector, config.stats_stream.clone())),
        source: Arc::new(source),
    })
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
