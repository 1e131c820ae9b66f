// SPDX-License-Identifier: BUSL-1.1

//! Join execution manager.
//!
//! Orchestrates the full pipeline for one search request:
//! extract directives → resolve relations concurrently → inject filters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use tokio::time::{timeout, Duration};
use tracing::{info, instrument};

use crate::engine::catalog::QueryCatalog;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::ExecutionContext;
use crate::metrics;

use super::injector::inject_filter;
use super::planner::JoinPlanner;
use super::types::{
    AppliedJoin, JoinDirective, JoinMetadata, JoinOutcome, JoinRelation, DEFAULT_JOIN_TIMEOUT_MS,
};

/// Key of the directive list in an inbound search body.
pub const JOINS_KEY: &str = "joins";

/// Source id reported when the global join timeout fires.
const JOIN_TIMEOUT_SOURCE: &str = "joins";

/// Catalog and relations, swapped as one unit on reload.
struct EngineState {
    planner: JoinPlanner,
    relations: HashMap<String, JoinRelation>,
}

impl EngineState {
    fn new(catalog: QueryCatalog, relations: Vec<JoinRelation>) -> Self {
        Self {
            planner: JoinPlanner::new(Arc::new(catalog)),
            relations: relations.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    fn relation(&self, id: &str) -> EngineResult<&JoinRelation> {
        self.relations
            .get(id)
            .ok_or_else(|| EngineError::relation_not_found(id))
    }
}

/// Entry point used by the proxy layer.
pub struct JoinEngine {
    state: RwLock<Arc<EngineState>>,
    join_timeout_ms: u64,
}

impl JoinEngine {
    pub fn new(catalog: QueryCatalog, relations: Vec<JoinRelation>) -> Self {
        Self {
            state: RwLock::new(Arc::new(EngineState::new(catalog, relations))),
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
        }
    }

    pub fn with_join_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.join_timeout_ms = timeout_ms;
        self
    }

    /// Replaces catalog and relations atomically.
    ///
    /// Requests already in flight finish against the previous configuration.
    pub fn reload(&self, catalog: QueryCatalog, relations: Vec<JoinRelation>) {
        let next = Arc::new(EngineState::new(catalog, relations));
        let count = next.relations.len();
        *self.state.write() = next;
        info!(relations = count, "Join configuration reloaded");
    }

    fn snapshot(&self) -> Arc<EngineState> {
        Arc::clone(&self.state.read())
    }

    pub fn relation(&self, id: &str) -> EngineResult<JoinRelation> {
        self.snapshot().relation(id).cloned()
    }

    pub fn relation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.snapshot().relations.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Resolves a single relation by id.
    pub async fn resolve_relation(
        &self,
        relation_id: &str,
        ctx: &ExecutionContext,
    ) -> EngineResult<JoinOutcome> {
        let state = self.snapshot();
        let relation = state.relation(relation_id)?;
        state.planner.resolve(relation, ctx).await
    }

    /// Rewrites a search body: join directives are removed and replaced by
    /// filters restricting each directive's field to its relation's values.
    ///
    /// Bodies without directives pass through unchanged.
    #[instrument(skip_all, fields(request_id = %ctx.request_id))]
    pub async fn prepare_search(
        &self,
        body: JsonValue,
        ctx: &ExecutionContext,
    ) -> EngineResult<(JsonValue, JoinMetadata)> {
        let total_start = Instant::now();
        let mut body = body;
        let directives = extract_directives(&mut body)?;
        if directives.is_empty() {
            return Ok((body, JoinMetadata::default()));
        }

        let state = self.snapshot();
        let resolutions = directives.iter().map(|directive| {
            let state = Arc::clone(&state);
            async move {
                let relation = state.relation(&directive.relation)?;
                state.planner.resolve(relation, ctx).await
            }
        });

        let outcomes = match timeout(
            Duration::from_millis(self.join_timeout_ms),
            try_join_all(resolutions),
        )
        .await
        {
            Ok(outcomes) => outcomes?,
            Err(_) => {
                metrics::record_timeout();
                return Err(EngineError::timeout(JOIN_TIMEOUT_SOURCE, self.join_timeout_ms));
            }
        };

        let mut metadata = JoinMetadata::default();
        for (directive, outcome) in directives.iter().zip(outcomes) {
            inject_filter(&mut body, &directive.relation, &directive.field, &outcome.values)?;

            metadata.warnings.extend(outcome.warnings);
            metadata.joins.push(AppliedJoin {
                relation: directive.relation.clone(),
                field: directive.field.clone(),
                value_count: outcome.values.len(),
                branches: outcome.branches,
            });
        }
        metadata.total_time_ms = total_start.elapsed().as_secs_f64() * 1000.0;

        info!(
            joins = metadata.joins.len(),
            total_time_ms = metadata.total_time_ms,
            "Search body prepared"
        );
        Ok((body, metadata))
    }
}

/// Removes and parses the `"joins"` array of a search body.
pub fn extract_directives(body: &mut JsonValue) -> EngineResult<Vec<JoinDirective>> {
    let obj = body
        .as_object_mut()
        .ok_or_else(|| EngineError::validation("Search body must be a JSON object"))?;

    match obj.remove(JOINS_KEY) {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(joins @ JsonValue::Array(_)) => serde_json::from_value(joins)
            .map_err(|e| EngineError::validation(format!("Invalid join directive: {e}"))),
        Some(_) => Err(EngineError::validation("\"joins\" must be an array")),
    }
}
