// SPDX-License-Identifier: Apache-2.0

//! Result cache
//!
//! Every query execution consults a `CacheStore` keyed by a fingerprint of
//! the connection target, populated query text, refresh flag, variable
//! binding and caller identity. Stores report failures as errors; callers
//! treat those as misses.

pub mod codec;
pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::engine::error::EngineResult;
use crate::engine::types::{CacheKey, ResultSet};

pub use memory::MemoryCacheStore;
pub use redis_store::RedisCacheStore;

/// Prefix shared by every generated cache key.
pub const CACHE_KEY_PREFIX: &str = "joinery:";

/// Pluggable key → result store with TTL
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns a short identifier for logs (e.g., "memory", "redis")
    fn store_id(&self) -> &'static str;

    async fn get(&self, key: &CacheKey) -> EngineResult<Option<ResultSet>>;

    /// Stores `value` under `key`, replacing any previous entry.
    ///
    /// A zero `ttl` means the value is not cacheable.
    async fn set(&self, key: &CacheKey, value: &ResultSet, ttl: Duration) -> EngineResult<()>;

    async fn invalidate(&self, key: &CacheKey) -> EngineResult<()>;

    /// Drops every entry owned by this store.
    async fn clear(&self) -> EngineResult<()>;
}

/// Builds the cache fingerprint for one execution.
///
/// The components are encoded as a JSON array before hashing, so no two
/// distinct tuples share an encoding (`("ab", "c")` vs `("a", "bc")`).
pub fn fingerprint(
    connection_identity: &str,
    result_query: &str,
    force_refresh: bool,
    variable_binding: &str,
    caller_identity: &str,
) -> CacheKey {
    let canonical = serde_json::json!([
        connection_identity,
        result_query,
        force_refresh,
        variable_binding,
        caller_identity,
    ])
    .to_string();

    let digest = Sha256::digest(canonical.as_bytes());
    CacheKey::new(format!("{CACHE_KEY_PREFIX}{digest:x}"))
}
