// SPDX-License-Identifier: Apache-2.0

//! Shared result cache for multi-process deployments, backed by Redis.
//!
//! Results are stored in the tagged JSON form of `codec` with a millisecond
//! expiry. The connection is opened on first use and reconnects on its own
//! afterwards.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{CacheKey, ResultSet};

use super::{codec, CacheStore};

/// Namespace prepended to every key written by this store.
pub const DEFAULT_KEY_PREFIX: &str = "joinery:cache:";

/// Number of keys requested per SCAN round when clearing.
const SCAN_BATCH: usize = 500;

pub struct RedisCacheStore {
    client: redis::Client,
    prefix: String,
    connection: OnceCell<ConnectionManager>,
}

impl RedisCacheStore {
    pub fn new(url: &str) -> EngineResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| EngineError::cache(format!("Invalid Redis URL: {e}")))?;

        Ok(Self {
            client,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            connection: OnceCell::new(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn storage_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn connection(&self) -> EngineResult<ConnectionManager> {
        self.connection
            .get_or_try_init(|| async {
                self.client
                    .get_connection_manager()
                    .await
                    .map_err(|e| EngineError::cache(format!("Redis connection failed: {e}")))
            })
            .await
            .cloned()
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    fn store_id(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &CacheKey) -> EngineResult<Option<ResultSet>> {
        let mut conn = self.connection().await?;

        let payload = redis::cmd("GET")
            .arg(self.storage_key(key))
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(|e| EngineError::cache(format!("GET failed: {e}")))?;

        payload.as_deref().map(codec::decode).transpose()
    }

    async fn set(&self, key: &CacheKey, value: &ResultSet, ttl: Duration) -> EngineResult<()> {
        if ttl.is_zero() {
            debug!(key = %key, "Zero TTL, result not cached");
            return Ok(());
        }

        let payload = codec::encode(value)?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);

        let mut conn = self.connection().await?;
        redis::cmd("SET")
            .arg(self.storage_key(key))
            .arg(payload)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| EngineError::cache(format!("SET failed: {e}")))
    }

    async fn invalidate(&self, key: &CacheKey) -> EngineResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(self.storage_key(key))
            .query_async::<i64>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::cache(format!("DEL failed: {e}")))
    }

    async fn clear(&self) -> EngineResult<()> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", self.prefix);
        let mut cursor: u64 = 0;

        loop {
            let (next, keys) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await
                .map_err(|e| EngineError::cache(format!("SCAN failed: {e}")))?;

            if !keys.is_empty() {
                redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<i64>(&mut conn)
                    .await
                    .map_err(|e| EngineError::cache(format!("DEL failed: {e}")))?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(())
    }
}
