use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::error::{AppError, AppResult};

/// Cache-aside accelerator holding `token -> original_url`.
///
/// Never authoritative: a miss says nothing about whether the token exists.
#[async_trait]
pub trait MappingCache: Send + Sync {
    async fn get_original_url(&self, token: &str) -> AppResult<Option<String>>;

    async fn set_mapping(&self, original_url: &str, token: &str) -> AppResult<()>;

    /// Fails with `NotFound` when the key was not cached.
    async fn delete_mapping(&self, token: &str) -> AppResult<()>;
}

/// Thread-safe in-memory cache mapping token -> original_url.
///
/// Backed by a DashMap so reads are concurrent and lock-free for most cases.
/// Entries have no TTL; they are filled lazily by redirects and removed by
/// explicit invalidation after updates and deletes.
#[derive(Clone, Debug, Default)]
pub struct MemoryCache {
    inner: Arc<DashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl MappingCache for MemoryCache {
    async fn get_original_url(&self, token: &str) -> AppResult<Option<String>> {
        Ok(self.inner.get(token).map(|v| v.clone()))
    }

    async fn set_mapping(&self, original_url: &str, token: &str) -> AppResult<()> {
        self.inner.insert(token.to_owned(), original_url.to_owned());
        Ok(())
    }

    async fn delete_mapping(&self, token: &str) -> AppResult<()> {
        match self.inner.remove(token) {
            Some(_) => Ok(()),
            None => Err(AppError::NotFound(format!(
                "token '{token}' not present in cache"
            ))),
        }
    }
}
