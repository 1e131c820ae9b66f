// SPDX-License-Identifier: BUSL-1.1

//! Join planner.
//!
//! Resolves a `JoinRelation` into the value set that constrains a search:
//! sequence relations chain their steps, set relations run them concurrently
//! and combine the values by union or intersection.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::engine::catalog::QueryCatalog;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::QueryExecutor;
use crate::engine::types::{distinct_values, ExecutionContext, ResultSet, Value};
use crate::metrics;

use super::types::{
    BranchReport, BranchStatus, FailurePolicy, JoinMode, JoinOutcome, JoinRelation, JoinStep,
    SetOperation,
};

type BranchResult = (EngineResult<ResultSet>, f64);

/// Resolves relations against a query catalog.
#[derive(Clone)]
pub struct JoinPlanner {
    catalog: Arc<QueryCatalog>,
}

impl JoinPlanner {
    pub fn new(catalog: Arc<QueryCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &QueryCatalog {
        &self.catalog
    }

    /// Computes the join values of `relation` for one request.
    #[instrument(skip_all, fields(relation = %relation.id, request_id = %ctx.request_id))]
    pub async fn resolve(
        &self,
        relation: &JoinRelation,
        ctx: &ExecutionContext,
    ) -> EngineResult<JoinOutcome> {
        if relation.steps.is_empty() {
            return Err(EngineError::validation(format!(
                "Relation '{}' has no steps",
                relation.id
            )));
        }

        let executors = relation
            .steps
            .iter()
            .map(|step| self.catalog.get(&step.query))
            .collect::<EngineResult<Vec<_>>>()?;

        let start = Instant::now();
        let outcome = match relation.mode {
            JoinMode::Sequence => resolve_sequence(relation, &executors, ctx).await,
            JoinMode::Set {
                operation,
                failure_policy,
            } => resolve_set(relation, &executors, ctx, operation, failure_policy).await,
        };
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::record_join(elapsed_ms, outcome.is_ok());

        if let Ok(outcome) = &outcome {
            debug!(values = outcome.values.len(), elapsed_ms, "Relation resolved");
        }
        outcome
    }
}

/// Runs one executor call as its own task.
///
/// The task keeps running when the caller is cancelled, so the backend call
/// completes and its result still reaches the cache.
fn spawn_fetch(
    executor: Arc<dyn QueryExecutor>,
    ctx: ExecutionContext,
    variable_binding: String,
) -> JoinHandle<BranchResult> {
    tokio::spawn(async move {
        let start = Instant::now();
        let result = executor
            .fetch_results(&ctx, ctx.force_refresh, &variable_binding)
            .await;
        (result, start.elapsed().as_secs_f64() * 1000.0)
    })
}

async fn await_branch(handle: JoinHandle<BranchResult>) -> BranchResult {
    match handle.await {
        Ok(result) => result,
        Err(e) => (
            Err(EngineError::internal(format!("Join branch task failed: {e}"))),
            0.0,
        ),
    }
}

fn report(
    index: usize,
    step: &JoinStep,
    executor: &dyn QueryExecutor,
    status: BranchStatus,
) -> BranchReport {
    BranchReport {
        index,
        query_id: step.query.clone(),
        source_id: executor.source_id().to_string(),
        row_count: 0,
        elapsed_ms: 0.0,
        status,
        error: None,
    }
}

async fn resolve_sequence(
    relation: &JoinRelation,
    executors: &[Arc<dyn QueryExecutor>],
    ctx: &ExecutionContext,
) -> EngineResult<JoinOutcome> {
    let mut step_ctx = ctx.clone();
    let mut values: Vec<Value> = Vec::new();
    let mut branches = Vec::with_capacity(relation.steps.len());
    let mut exhausted = false;

    for (index, (step, executor)) in relation.steps.iter().zip(executors).enumerate() {
        if exhausted {
            branches.push(report(index, step, executor.as_ref(), BranchStatus::Skipped));
            continue;
        }

        let handle = spawn_fetch(Arc::clone(executor), step_ctx.clone(), step.column.clone());
        let (result, elapsed_ms) = await_branch(handle).await;

        let results = result.map_err(|e| {
            warn!(
                branch = index,
                query = %step.query,
                source = %executor.source_id(),
                error = %e,
                "Join step failed"
            );
            EngineError::join(&relation.id, index, executor.source_id(), &e)
        })?;

        values = results.distinct_column_values(&step.column);
        branches.push(BranchReport {
            row_count: results.len(),
            elapsed_ms,
            ..report(index, step, executor.as_ref(), BranchStatus::Ok)
        });

        if values.is_empty() {
            debug!(branch = index, query = %step.query, "Join step came back empty, skipping the rest");
            exhausted = true;
        } else {
            step_ctx
                .variables
                .insert(step.binding_name().to_string(), Value::Array(values.clone()));
        }
    }

    Ok(JoinOutcome {
        relation: relation.id.clone(),
        values,
        branches,
        warnings: Vec::new(),
    })
}

async fn resolve_set(
    relation: &JoinRelation,
    executors: &[Arc<dyn QueryExecutor>],
    ctx: &ExecutionContext,
    operation: SetOperation,
    failure_policy: FailurePolicy,
) -> EngineResult<JoinOutcome> {
    let handles: Vec<_> = relation
        .steps
        .iter()
        .zip(executors)
        .map(|(step, executor)| spawn_fetch(Arc::clone(executor), ctx.clone(), step.column.clone()))
        .collect();

    let mut survivors: Vec<Vec<Value>> = Vec::with_capacity(handles.len());
    let mut branches = Vec::with_capacity(handles.len());
    let mut warnings = Vec::new();
    let mut first_failure: Option<EngineError> = None;

    // Awaited in index order: a failure is final once every lower branch has
    // finished, and higher branches keep running in their own tasks.
    for (index, ((step, executor), handle)) in relation
        .steps
        .iter()
        .zip(executors)
        .zip(handles)
        .enumerate()
    {
        let (result, elapsed_ms) = await_branch(handle).await;
        match result {
            Ok(results) => {
                survivors.push(results.distinct_column_values(&step.column));
                branches.push(BranchReport {
                    row_count: results.len(),
                    elapsed_ms,
                    ..report(index, step, executor.as_ref(), BranchStatus::Ok)
                });
            }
            Err(e) => {
                warn!(
                    branch = index,
                    query = %step.query,
                    source = %executor.source_id(),
                    error = %e,
                    "Join branch failed"
                );
                let joined = EngineError::join(&relation.id, index, executor.source_id(), &e);

                if failure_policy == FailurePolicy::FailFast {
                    return Err(joined);
                }

                warnings.push(format!(
                    "Branch {index} ({}) of relation '{}' was dropped: {e}",
                    step.query, relation.id
                ));
                branches.push(BranchReport {
                    elapsed_ms,
                    error: Some(e.to_string()),
                    ..report(index, step, executor.as_ref(), BranchStatus::Failed)
                });
                first_failure.get_or_insert(joined);
            }
        }
    }

    if survivors.is_empty() {
        return Err(first_failure
            .unwrap_or_else(|| EngineError::internal("Set relation produced no branches")));
    }

    let values = match operation {
        SetOperation::Union => union(survivors),
        SetOperation::Intersection => intersection(survivors),
    };

    Ok(JoinOutcome {
        relation: relation.id.clone(),
        values,
        branches,
        warnings,
    })
}

/// Every value of every branch, in branch priority order.
fn union(branches: Vec<Vec<Value>>) -> Vec<Value> {
    distinct_values(branches.into_iter().flatten())
}

/// Values present in every branch, in the order of the first branch.
fn intersection(branches: Vec<Vec<Value>>) -> Vec<Value> {
    let mut iter = branches.into_iter();
    let Some(first) = iter.next() else {
        return Vec::new();
    };

    let others: Vec<HashSet<String>> = iter
        .map(|values| values.iter().map(Value::canonical_text).collect())
        .collect();

    distinct_values(first)
        .into_iter()
        .filter(|v| {
            let key = v.canonical_text();
            others.iter().all(|set| set.contains(&key))
        })
        .collect()
}
