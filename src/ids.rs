use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::{error::AppResult, store::MappingReader};

/// Shared counter with atomic increment (`SET`/`INCR`/`GET`/`DEL` semantics).
#[async_trait]
pub trait CounterService: Send + Sync {
    async fn set(&self, key: &str, value: i64) -> AppResult<()>;

    /// Atomically add one and return the new value. Missing keys start at 0.
    async fn incr(&self, key: &str) -> AppResult<i64>;

    async fn get(&self, key: &str) -> AppResult<Option<i64>>;

    async fn del(&self, key: &str) -> AppResult<()>;
}

/// Process-local counter for single-instance deployments and tests.
#[derive(Clone, Debug, Default)]
pub struct MemoryCounter {
    inner: Arc<DashMap<String, i64>>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterService for MemoryCounter {
    async fn set(&self, key: &str, value: i64) -> AppResult<()> {
        self.inner.insert(key.to_owned(), value);
        Ok(())
    }

    async fn incr(&self, key: &str) -> AppResult<i64> {
        // The entry guard holds the shard lock for the read-modify-write
        let mut entry = self.inner.entry(key.to_owned()).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    async fn get(&self, key: &str) -> AppResult<Option<i64>> {
        Ok(self.inner.get(key).map(|v| *v))
    }

    async fn del(&self, key: &str) -> AppResult<()> {
        self.inner.remove(key);
        Ok(())
    }
}

/// Hands out mapping ids that are unique across restarts.
///
/// Construction seeds the shared counter with the durable store's last id.
/// Only one allocator may be constructed, and it must be constructed before
/// traffic is accepted: seeding is not atomic with concurrent writers.
pub struct IdAllocator {
    counter: Arc<dyn CounterService>,
    key: String,
}

impl IdAllocator {
    pub async fn new(
        counter: Arc<dyn CounterService>,
        key: impl Into<String>,
        reader: &dyn MappingReader,
    ) -> AppResult<Self> {
        let key = key.into();
        let last_id = reader.get_last_id().await?;
        counter.set(&key, last_id).await?;
        tracing::info!("Id allocator seeded at {} (key '{}')", last_id, key);

        Ok(Self { counter, key })
    }

    pub async fn next_id(&self) -> AppResult<i64> {
        self.counter.incr(&self.key).await
    }
}
