use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite connection string, e.g. "sqlite:./linkstat.db"
    pub database_url: String,

    /// Redis URL for the cache, id counter and stats stream.
    /// When unset, in-process implementations are used instead.
    pub redis_url: Option<String>,

    /// Host to bind the HTTP server to, e.g. "0.0.0.0"
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Path to a GeoLite2-City database, opened once at startup
    pub geoip_db_path: String,

    /// Stream (topic) carrying raw stats events
    pub stats_stream: String,

    /// Consumer group shared by all stats consumers
    pub stats_group: String,

    /// This process's name within the consumer group
    pub stats_consumer: String,

    pub cache_key_prefix: String,

    /// Redis key holding the id counter
    pub counter_key: String,
}

impl AppConfig {
    /// Load configuration from environment variables (populated by dotenvy before this is called).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = var("PORT")
            .unwrap_or_else(|| "8080".into())
            .parse::<u16>()
            .context("PORT must be a valid port number (1–65535)")?;

        let redis_url = var("REDIS_URL")
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty());

        let stats_consumer = var("STATS_CONSUMER")
            .or_else(|| var("HOSTNAME"))
            .map(|name| format!("linkstat-{name}"))
            .unwrap_or_else(|| format!("linkstat-{}", uuid::Uuid::new_v4()));

        Ok(Self {
            database_url: var("DATABASE_URL").unwrap_or_else(|| "sqlite:./linkstat.db".into()),
            redis_url,
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            geoip_db_path: var("GEOIP_DB_PATH")
                .unwrap_or_else(|| "assets/GeoLite2-City.mmdb".into()),
            stats_stream: var("STATS_STREAM").unwrap_or_else(|| "url_stats_events".into()),
            stats_group: var("STATS_GROUP").unwrap_or_else(|| "url_stats_group".into()),
            stats_consumer,
            cache_key_prefix: var("CACHE_KEY_PREFIX").unwrap_or_else(|| "linkstat:url:".into()),
            counter_key: var("COUNTER_KEY").unwrap_or_else(|| "mapping_count".into()),
        })
    }
}
