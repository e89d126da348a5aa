//! Capability traits for the durable stores.
//!
//! The mapping store is split by direction so read-only consumers (the id
//! allocator seed step, the redirect path) only see what they use. The stats
//! store backs both the consumer loop (writes) and the aggregator (reads).

use async_trait::async_trait;

use crate::{
    error::AppResult,
    models::{EnrichedStatsEvent, MappingRecord},
};

#[async_trait]
pub trait MappingReader: Send + Sync {
    /// `Ok(None)` means the token is confirmed absent; `Err` means the store
    /// could not be asked.
    async fn get_mapping_by_token(&self, token: &str) -> AppResult<Option<MappingRecord>>;

    /// Highest id ever stored, `0` when the table is empty.
    async fn get_last_id(&self) -> AppResult<i64>;
}

#[async_trait]
pub trait MappingWriter: Send + Sync {
    /// Fails with `AlreadyExists` if `id` (or `token`) is already stored.
    async fn add_new_mapping(
        &self,
        id: i64,
        original_url: &str,
        token: &str,
    ) -> AppResult<MappingRecord>;

    /// Fails with `NotFound` if no row has `token`.
    async fn update_original_url(&self, token: &str, new_url: &str) -> AppResult<MappingRecord>;

    /// Fails with `NotFound` if no row was deleted.
    async fn delete_mapping_info(&self, token: &str) -> AppResult<()>;
}

pub trait MappingStore: MappingReader + MappingWriter {}

impl<T: MappingReader + MappingWriter> MappingStore for T {}

/// A grouping column of the `stats_events` fact table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsDimension {
    Country,
    City,
    DeviceType,
    Referrer,
}

impl StatsDimension {
    pub fn column(&self) -> &'static str {
        match self {
            StatsDimension::Country => "country",
            StatsDimension::City => "city",
            StatsDimension::DeviceType => "device_type",
            StatsDimension::Referrer => "referrer",
        }
    }
}

#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Append an enriched event. Returns `false` when an event with the same
    /// id was already stored (redelivery).
    async fn add_stats_event(&self, event: &EnrichedStatsEvent) -> AppResult<bool>;

    async fn count_events(&self, token: &str) -> AppResult<i64>;

    async fn count_by(&self, token: &str, dimension: StatsDimension) -> AppResult<Vec<(String, i64)>>;
}
