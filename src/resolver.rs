use std::sync::Arc;
use url::Url;

use crate::{
    cache::MappingCache,
    error::{AppError, AppResult},
    ids::IdAllocator,
    models::MappingRecord,
    store::MappingStore,
    token,
};

/// Path segments routed before `/:token`; never issued as tokens.
pub const RESERVED_TOKENS: &[&str] = &["health", "shorten"];

/// Accept only absolute http(s) URLs with a non-empty host.
///
/// Returns the parsed URL; callers store its serialization, which is
/// percent-encoded ASCII and always a valid `Location` header value.
pub fn validate_url(raw: &str) -> AppResult<Url> {
    let parsed =
        Url::parse(raw).map_err(|_| AppError::InvalidInput(format!("invalid url provided: {raw}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::InvalidInput(format!(
            "unsupported URL scheme: {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(AppError::InvalidInput(format!("invalid url provided: {raw}")));
    }
    Ok(parsed)
}

/// Cache-aside orchestration of the four mapping use cases.
///
/// The store is always mutated before the cache is touched, and a store
/// failure aborts before any cache call. Cache failures never fail a request.
pub struct MappingResolver {
    store: Arc<dyn MappingStore>,
    cache: Arc<dyn MappingCache>,
    ids: Arc<IdAllocator>,
}

impl MappingResolver {
    pub fn new(
        store: Arc<dyn MappingStore>,
        cache: Arc<dyn MappingCache>,
        ids: Arc<IdAllocator>,
    ) -> Self {
        Self { store, cache, ids }
    }

    /// Validate, allocate an id, derive its token and persist.
    ///
    /// The cache is filled lazily by the first redirect.
    pub async fn shorten(&self, original_url: &str) -> AppResult<MappingRecord> {
        let url = validate_url(original_url)?;

        // Skip ids whose token would be shadowed by a static route
        let (id, token) = loop {
            let id = self.ids.next_id().await?;
            let id_bits = u64::try_from(id)
                .map_err(|_| AppError::Unavailable(format!("counter returned negative id {id}")))?;
            let token = token::encode(id_bits);
            if !RESERVED_TOKENS.contains(&token.as_str()) {
                break (id, token);
            }
            tracing::debug!("Skipping id {} (token '{}' is reserved)", id, token);
        };

        self.store.add_new_mapping(id, url.as_str(), &token).await
    }

    pub async fn get_original_url(&self, token: &str) -> AppResult<String> {
        // Nothing outside the alphabet can ever have been issued
        if token::decode(token).is_none() {
            return Err(AppError::NotFound(format!(
                "short URL not found for token '{token}'"
            )));
        }

        match self.cache.get_original_url(token).await {
            Ok(Some(url)) => return Ok(url),
            Ok(None) => {}
            Err(e) => tracing::warn!("Cache lookup for '{}' failed: {}", token, e),
        }

        let record = self
            .store
            .get_mapping_by_token(token)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("short URL not found for token '{token}'")))?;

        // Backfill the cache for next time
        if let Err(e) = self.cache.set_mapping(&record.original_url, token).await {
            tracing::warn!("Failed to cache mapping for '{}': {}", token, e);
        }

        Ok(record.original_url)
    }

    /// Replace the URL in the store, then drop the cached copy so readers do
    /// not keep getting the old one.
    pub async fn update_url_mapping(&self, token: &str, new_url: &str) -> AppResult<MappingRecord> {
        let url = validate_url(new_url)?;

        let record = self.store.update_original_url(token, url.as_str()).await?;
        tracing::info!("Updated URL mapping for token '{}'", token);

        self.invalidate(token).await;
        Ok(record)
    }

    pub async fn delete_url(&self, token: &str) -> AppResult<()> {
        self.store.delete_mapping_info(token).await?;
        self.invalidate(token).await;
        Ok(())
    }

    async fn invalidate(&self, token: &str) {
        match self.cache.delete_mapping(token).await {
            Ok(()) => {}
            Err(AppError::NotFound(msg)) => tracing::warn!("{}", msg),
            Err(e) => tracing::warn!("Failed to evict '{}' from cache: {}", token, e),
        }
    }
}
