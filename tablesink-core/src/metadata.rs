//! Route and processor metadata lookup, with a short-lived local cache in front of the backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;
use serde_json::Value;
use tracing::trace;

use crate::{Error, Result};

/// Aggressive default, there is no central cache to invalidate entries.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Route {
    pub id: String,
    pub processor_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Processor {
    pub id: String,
    /// Key/value property blob holding the table processor configuration.
    pub properties: Option<Value>,
}

#[async_trait]
pub trait MetadataLookup: Send + Sync {
    async fn find_route_by_id(&self, id: &str) -> Result<Route>;

    async fn find_processor_by_id(&self, id: &str) -> Result<Processor>;
}

/// Upper bound on cached entries per kind.
pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

/// TTL cache over a [MetadataLookup]. Only successful lookups are cached.
pub struct CachedLookup<L> {
    inner: Arc<L>,
    routes: Cache<String, Route>,
    processors: Cache<String, Processor>,
}

impl<L> CachedLookup<L> {
    pub fn new(inner: L, ttl: Duration) -> Self {
        Self::with_capacity(inner, ttl, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(inner: L, ttl: Duration, max_capacity: u64) -> Self {
        Self {
            inner: Arc::new(inner),
            routes: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
            processors: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Drops every cached entry.
    pub async fn purge(&self) {
        self.routes.invalidate_all();
        self.processors.invalidate_all();
        self.run_pending_tasks().await;
    }

    async fn run_pending_tasks(&self) {
        self.routes.run_pending_tasks().await;
        self.processors.run_pending_tasks().await;
    }

    #[cfg(test)]
    async fn entry_count(&self) -> u64 {
        self.run_pending_tasks().await;
        self.routes.entry_count() + self.processors.entry_count()
    }
}

// the loader error is shared between concurrent callers of the same key
fn unshare(e: Arc<Error>) -> Error {
    Arc::try_unwrap(e).unwrap_or_else(|e| (*e).clone())
}

#[async_trait]
impl<L: MetadataLookup + 'static> MetadataLookup for CachedLookup<L> {
    async fn find_route_by_id(&self, id: &str) -> Result<Route> {
        let inner = Arc::clone(&self.inner);
        let key = id.to_string();
        let route = self
            .routes
            .try_get_with(key.clone(), async move {
                trace!(route_id = %key, "Route cache miss");
                inner.find_route_by_id(&key).await
            })
            .await
            .map_err(unshare)?;
        Ok(route)
    }

    async fn find_processor_by_id(&self, id: &str) -> Result<Processor> {
        let inner = Arc::clone(&self.inner);
        let key = id.to_string();
        let processor = self
            .processors
            .try_get_with(key.clone(), async move {
                trace!(processor_id = %key, "Processor cache miss");
                inner.find_processor_by_id(&key).await
            })
            .await
            .map_err(unshare)?;
        Ok(processor)
    }
}
