// SPDX-License-Identifier: Apache-2.0

//! In-process result cache with size and per-entry TTL eviction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use tracing::debug;

use crate::engine::error::EngineResult;
use crate::engine::types::{CacheKey, ResultSet};

use super::CacheStore;

/// Default maximum number of cached results.
pub const DEFAULT_MAX_ENTRIES: u64 = 500;

#[derive(Debug, Clone)]
struct CachedResult {
    result: Arc<ResultSet>,
    ttl: Duration,
}

/// Expires each entry after the TTL it was written with.
struct PerEntryTtl;

impl Expiry<String, CachedResult> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedResult,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedResult,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Single-process cache store backed by moka
///
/// Concurrent writes to different keys do not contend; writes to the same key
/// are last-write-wins.
pub struct MemoryCacheStore {
    cache: Cache<String, CachedResult>,
}

impl MemoryCacheStore {
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }

    /// Number of live entries, after pending evictions are applied.
    pub async fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    fn store_id(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> EngineResult<Option<ResultSet>> {
        Ok(self
            .cache
            .get(key.as_str())
            .await
            .map(|entry| entry.result.as_ref().clone()))
    }

    async fn set(&self, key: &CacheKey, value: &ResultSet, ttl: Duration) -> EngineResult<()> {
        if ttl.is_zero() {
            debug!(key = %key, "Zero TTL, result not cached");
            return Ok(());
        }

        let entry = CachedResult {
            result: Arc::new(value.clone()),
            ttl,
        };
        self.cache.insert(key.as_str().to_string(), entry).await;
        Ok(())
    }

    async fn invalidate(&self, key: &CacheKey) -> EngineResult<()> {
        self.cache.invalidate(key.as_str()).await;
        Ok(())
    }

    async fn clear(&self) -> EngineResult<()> {
        self.cache.invalidate_all();
        Ok(())
    }
}
