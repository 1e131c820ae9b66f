// SPDX-License-Identifier: Apache-2.0

//! QueryExecutor trait definition
//!
//! This is the core abstraction that every backend implements. A backend
//! supplies connection setup (`initialize`), raw execution (`execute_raw`)
//! and, optionally, its own normalization; the trait provides the shared
//! `fetch_results` pipeline: activation check, parameter population, cache
//! lookup, execution, normalization and cache write.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cache::{self, CacheStore};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{
    Binding, CacheKey, ExecutionContext, QuerySpec, RawResponse, ResultSet, Value,
};
use crate::metrics;

/// Core trait that every backend executor implements
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Returns the backend type identifier (e.g., "search", "jdbc", "mysql")
    fn backend_id(&self) -> &'static str;

    /// The query this executor runs
    fn spec(&self) -> &QuerySpec;

    /// Cache store handle, if one was injected
    fn cache(&self) -> Option<&Arc<dyn CacheStore>>;

    /// Stable description of the connection target, free of secrets
    fn connection_identity(&self) -> String;

    /// Datasource this executor is attributed to in errors and logs
    fn source_id(&self) -> &str {
        &self.spec().datasource.id
    }

    /// Establishes or validates the backend connection
    ///
    /// Must be idempotent: calling it again after success is a no-op.
    async fn initialize(&self) -> EngineResult<()>;

    /// Runs already-populated query text against the backend
    async fn execute_raw(&self, query: &str, variable_binding: &str) -> EngineResult<RawResponse>;

    /// Turns a raw backend response into a `ResultSet`
    fn normalize(&self, raw: RawResponse) -> EngineResult<ResultSet> {
        Ok(normalize_raw(raw))
    }

    /// Derives the cache key for one execution. Pure, no I/O.
    fn generate_cache_key(
        &self,
        connection_identity: &str,
        result_query: &str,
        force_refresh: bool,
        variable_binding: &str,
        caller_identity: &str,
    ) -> CacheKey {
        cache::fingerprint(
            connection_identity,
            result_query,
            force_refresh,
            variable_binding,
            caller_identity,
        )
    }

    /// Evaluates the activation query
    ///
    /// An empty activation query always activates. Otherwise the query is
    /// active when its activation query returns at least one row.
    async fn is_active(&self, ctx: &ExecutionContext) -> EngineResult<bool> {
        let spec = self.spec();
        if spec.activation_query.trim().is_empty() {
            return Ok(true);
        }

        let query = spec.datasource.parameters.populate(&spec.activation_query, ctx)?;
        self.initialize().await?;
        let raw = self.run_with_timeout(&query, "").await?;
        Ok(!self.normalize(raw)?.is_empty())
    }

    /// Fetches the results of this query for one request
    ///
    /// Cached results are served when caching is enabled for the datasource
    /// and `force_refresh` is false. Backend failures are never cached.
    async fn fetch_results(
        &self,
        ctx: &ExecutionContext,
        force_refresh: bool,
        variable_binding: &str,
    ) -> EngineResult<ResultSet> {
        let spec = self.spec();
        let source = &spec.datasource;

        if !self.is_active(ctx).await? {
            debug!(query = %spec.id, source = %source.id, "Activation query did not match, skipping");
            return Ok(ResultSet::empty());
        }

        let query = source.parameters.populate(&spec.result_query, ctx)?;
        let key = self.generate_cache_key(
            &self.connection_identity(),
            &query,
            force_refresh,
            variable_binding,
            ctx.identity(),
        );

        let cache = self.cache().filter(|_| source.cache_enabled);

        if let Some(store) = cache {
            if !force_refresh {
                match store.get(&key).await {
                    Ok(Some(hit)) => {
                        metrics::record_cache_hit();
                        debug!(query = %spec.id, source = %source.id, key = %key, "Cache hit");
                        return Ok(hit);
                    }
                    Ok(None) => metrics::record_cache_miss(),
                    Err(e) => {
                        metrics::record_cache_error();
                        warn!(
                            query = %spec.id,
                            source = %source.id,
                            store = store.store_id(),
                            error = %e,
                            "Cache read failed, treating as miss"
                        );
                    }
                }
            }
        }

        self.initialize().await?;

        let start = Instant::now();
        let outcome = self.run_with_timeout(&query, variable_binding).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let raw = match outcome {
            Ok(raw) => raw,
            Err(e) => {
                metrics::record_backend_call(elapsed_ms, false);
                warn!(query = %spec.id, source = %source.id, error = %e, "Backend execution failed");
                return Err(e);
            }
        };
        metrics::record_backend_call(elapsed_ms, true);

        let mut results = self.normalize(raw)?;
        if let Some(max_results) = source.max_results {
            results.truncate(max_results);
        }

        debug!(
            query = %spec.id,
            source = %source.id,
            rows = results.len(),
            elapsed_ms,
            "Backend query completed"
        );

        if let Some(store) = cache {
            if let Err(e) = store.set(&key, &results, source.cache_ttl()).await {
                metrics::record_cache_error();
                warn!(
                    query = %spec.id,
                    source = %source.id,
                    store = store.store_id(),
                    error = %e,
                    "Cache write failed, result not cached"
                );
            }
        }

        Ok(results)
    }

    /// Runs `execute_raw` under the datasource timeout, if any
    async fn run_with_timeout(&self, query: &str, variable_binding: &str) -> EngineResult<RawResponse> {
        let source = &self.spec().datasource;
        match (source.timeout(), source.timeout_ms) {
            (Some(limit), Some(timeout_ms)) => {
                match timeout(limit, self.execute_raw(query, variable_binding)).await {
                    Ok(result) => result,
                    Err(_) => {
                        metrics::record_timeout();
                        Err(EngineError::timeout(source.id.clone(), timeout_ms))
                    }
                }
            }
            _ => self.execute_raw(query, variable_binding).await,
        }
    }
}

/// Default normalization shared by every backend.
///
/// Decoded SQL rows pass through unchanged. JSON documents are read as a
/// search response (`hits.hits[]`) or as a `results.bindings[]` document;
/// anything else yields no rows.
pub fn normalize_raw(raw: RawResponse) -> ResultSet {
    match raw {
        RawResponse::Rows(rows) => ResultSet::new(rows),
        RawResponse::Document(doc) => {
            if let Some(hits) = doc.pointer("/hits/hits").and_then(|h| h.as_array()) {
                return ResultSet::new(hits.iter().map(hit_to_binding).collect());
            }
            if let Some(rows) = doc.pointer("/results/bindings").and_then(|b| b.as_array()) {
                return ResultSet::new(rows.iter().filter_map(object_to_binding).collect());
            }
            ResultSet::empty()
        }
    }
}

/// Flattens a search hit into a binding: hit metadata plus top-level `_source` fields.
fn hit_to_binding(hit: &serde_json::Value) -> Binding {
    let mut binding = Binding::new();

    for meta in ["_id", "_index", "_score"] {
        if let Some(v) = hit.get(meta) {
            binding.insert(meta.to_string(), Value::from_json(v.clone()));
        }
    }

    if let Some(source) = hit.get("_source").and_then(|s| s.as_object()) {
        for (field, v) in source {
            binding.insert(field.clone(), Value::from_json(v.clone()));
        }
    }

    binding
}

fn object_to_binding(row: &serde_json::Value) -> Option<Binding> {
    row.as_object().map(|fields| {
        fields
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v.clone())))
            .collect()
    })
}
