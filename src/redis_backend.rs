//! Redis implementations of the mapping cache, the id counter and the stats
//! bus (Redis Streams with a consumer group).

use async_trait::async_trait;
use redis::{
    aio::MultiplexedConnection,
    streams::{StreamReadOptions, StreamReadReply},
    AsyncCommands, RedisResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::{
    bus::{BusMessage, EventPublisher, EventSource},
    cache::MappingCache,
    error::{AppError, AppResult},
    ids::CounterService,
    models::RawStatsEvent,
};

const PAYLOAD_FIELD: &str = "payload";

// ── Connection ─────────────────────────────────────────────────────────────

/// Lazily (re)established multiplexed connection shared by all Redis users.
#[derive(Clone)]
pub struct RedisConnector {
    client: redis::Client,
    connection: Arc<RwLock<Option<MultiplexedConnection>>>,
}

impl RedisConnector {
    /// Open a client and verify the server answers `PING`.
    pub async fn connect(url: &str) -> AppResult<Self> {
        let connector = Self {
            client: redis::Client::open(url)?,
            connection: Arc::new(RwLock::new(None)),
        };

        let mut conn = connector.connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!("Redis connection test successful: {}", pong);

        Ok(connector)
    }

    async fn connection(&self) -> RedisResult<MultiplexedConnection> {
        {
            let guard = self.connection.read().await;
            if let Some(ref conn) = *guard {
                return Ok(conn.clone());
            }
        }

        let mut guard = self.connection.write().await;
        // Another task may have connected while we waited for the write lock
        if let Some(ref conn) = *guard {
            return Ok(conn.clone());
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(conn.clone());
        debug!("Redis connection established and cached");
        Ok(conn)
    }

    async fn reset(&self) {
        *self.connection.write().await = None;
        debug!("Redis connection reset due to error");
    }

    /// Drop the cached connection after transport failures so the next call
    /// reconnects.
    async fn check<T>(&self, result: RedisResult<T>) -> AppResult<T> {
        if let Err(ref e) = result {
            if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                self.reset().await;
            }
        }
        result.map_err(AppError::from)
    }
}

// ── Cache ──────────────────────────────────────────────────────────────────

pub struct RedisCache {
    connector: RedisConnector,
    key_prefix: String,
}

impl RedisCache {
    pub fn new(connector: RedisConnector, key_prefix: impl Into<String>) -> Self {
        Self {
            connector,
            key_prefix: key_prefix.into(),
        }
    }

    fn make_key(&self, token: &str) -> String {
        format!("{}{}", self.key_prefix, token)
    }
}

#[async_trait]
impl MappingCache for RedisCache {
    async fn get_original_url(&self, token: &str) -> AppResult<Option<String>> {
        let mut conn = self.connector.check(self.connector.connection().await).await?;
        let result = conn.get::<_, Option<String>>(self.make_key(token)).await;
        let url = self.connector.check(result).await?;
        trace!("Cache lookup for '{}': hit={}", token, url.is_some());
        Ok(url)
    }

    async fn set_mapping(&self, original_url: &str, token: &str) -> AppResult<()> {
        let mut conn = self.connector.check(self.connector.connection().await).await?;
        // No TTL: entries live until explicitly invalidated
        let result = conn.set::<_, _, ()>(self.make_key(token), original_url).await;
        self.connector.check(result).await
    }

    async fn delete_mapping(&self, token: &str) -> AppResult<()> {
        let mut conn = self.connector.check(self.connector.connection().await).await?;
        let result = conn.del::<_, i64>(self.make_key(token)).await;
        match self.connector.check(result).await? {
            0 => Err(AppError::NotFound(format!(
                "token '{token}' not present in redis"
            ))),
            _ => Ok(()),
        }
    }
}

// ── Counter ────────────────────────────────────────────────────────────────

pub struct RedisCounter {
    connector: RedisConnector,
}

impl RedisCounter {
    pub fn new(connector: RedisConnector) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl CounterService for RedisCounter {
    async fn set(&self, key: &str, value: i64) -> AppResult<()> {
        let mut conn = self.connector.check(self.connector.connection().await).await?;
        let result = conn.set::<_, _, ()>(key, value).await;
        self.connector.check(result).await
    }

    async fn incr(&self, key: &str) -> AppResult<i64> {
        let mut conn = self.connector.check(self.connector.connection().await).await?;
        let result = conn.incr::<_, _, i64>(key, 1).await;
        self.connector.check(result).await
    }

    async fn get(&self, key: &str) -> AppResult<Option<i64>> {
        let mut conn = self.connector.check(self.connector.connection().await).await?;
        let result = conn.get::<_, Option<i64>>(key).await;
        self.connector.check(result).await
    }

    async fn del(&self, key: &str) -> AppResult<()> {
        let mut conn = self.connector.check(self.connector.connection().await).await?;
        let result = conn.del::<_, i64>(key).await;
        self.connector.check(result).await.map(|_| ())
    }
}

// ── Stats stream ───────────────────────────────────────────────────────────

/// Publishes raw events as single-field (`payload`) stream entries.
pub struct RedisStreamPublisher {
    connector: RedisConnector,
    stream: String,
}

impl RedisStreamPublisher {
    pub fn new(connector: RedisConnector, stream: impl Into<String>) -> Self {
        Self {
            connector,
            stream: stream.into(),
        }
    }
}

#[async_trait]
impl EventPublisher for RedisStreamPublisher {
    async fn send_event(&self, event: &RawStatsEvent) -> AppResult<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.connector.check(self.connector.connection().await).await?;
        let result = conn
            .xadd::<_, _, _, _, String>(&self.stream, "*", &[(PAYLOAD_FIELD, payload)])
            .await;
        let id = self.connector.check(result).await?;
        trace!("Published stats event {} as {}", event.event_id, id);
        Ok(())
    }
}

/// Reads the stats stream as one consumer of a consumer group.
///
/// On startup the consumer first replays its own pending (delivered but never
/// acknowledged) entries, then switches to new entries. Commit is `XACK`.
pub struct RedisStreamSource {
    connector: RedisConnector,
    stream: String,
    group: String,
    consumer: String,
    poll_interval: Duration,
    /// Last pending id replayed; `None` once the backlog is drained.
    pending_cursor: Mutex<Option<String>>,
}

impl RedisStreamSource {
    /// Create the consumer group (and the stream) if they do not exist yet.
    pub async fn new(
        connector: RedisConnector,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        poll_interval: Duration,
    ) -> AppResult<Self> {
        let (stream, group, consumer) = (stream.into(), group.into(), consumer.into());

        let mut conn = connector.check(connector.connection().await).await?;
        let created: RedisResult<()> = conn.xgroup_create_mkstream(&stream, &group, "0").await;
        match created {
            Ok(()) => info!("Created consumer group '{}' on '{}'", group, stream),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!("Consumer group '{}' already exists on '{}'", group, stream)
            }
            Err(e) => connector.check::<()>(Err(e)).await?,
        }

        Ok(Self {
            connector,
            stream,
            group,
            consumer,
            poll_interval,
            pending_cursor: Mutex::new(Some("0".to_owned())),
        })
    }

    async fn read_one(&self, start_id: &str) -> AppResult<Option<(String, Vec<u8>)>> {
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1);

        let mut conn = self.connector.check(self.connector.connection().await).await?;
        let result = conn
            .xread_options::<_, _, Option<StreamReadReply>>(&[&self.stream], &[start_id], &opts)
            .await;
        let reply = self.connector.check(result).await?;

        Ok(reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .next()
            .map(|entry| {
                let payload = entry.get::<String>(PAYLOAD_FIELD).unwrap_or_default();
                (entry.id, payload.into_bytes())
            }))
    }
}

#[async_trait]
impl EventSource for RedisStreamSource {
    async fn fetch_message(&self) -> AppResult<Option<BusMessage>> {
        {
            let mut cursor = self.pending_cursor.lock().await;
            if let Some(start) = cursor.clone() {
                match self.read_one(&start).await? {
                    Some((id, payload)) => {
                        debug!("Replaying pending stats message {}", id);
                        *cursor = Some(id.clone());
                        return Ok(Some(BusMessage { id, payload }));
                    }
                    None => {
                        info!("Pending stats backlog drained");
                        *cursor = None;
                    }
                }
            }
        }

        match self.read_one(">").await? {
            Some((id, payload)) => Ok(Some(BusMessage { id, payload })),
            None => {
                tokio::time::sleep(self.poll_interval).await;
                Ok(None)
            }
        }
    }

    async fn commit_message(&self, msg: &BusMessage) -> AppResult<()> {
        let mut conn = self.connector.check(self.connector.connection().await).await?;
        let result = conn
            .xack::<_, _, _, i64>(&self.stream, &self.group, &[&msg.id])
            .await;
        self.connector.check(result).await.map(|_| ())
    }

    async fn close(&self) -> AppResult<()> {
        self.connector.reset().await;
        Ok(())
    }
}
