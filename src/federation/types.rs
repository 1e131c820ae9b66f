// SPDX-License-Identifier: BUSL-1.1

//! Types for the join federation engine.

use serde::{Deserialize, Serialize};

use crate::engine::types::Value;

/// Default global timeout for resolving every join of one search body (60 seconds).
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 60_000;

/// One satellite query taking part in a relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinStep {
    /// Query id in the catalog
    pub query: String,
    /// Column whose values the step contributes
    pub column: String,
    /// Variable name the values are bound to for the next step (sequence mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_as: Option<String>,
}

impl JoinStep {
    pub fn new(query: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            column: column.into(),
            bind_as: None,
        }
    }

    pub fn bind_as(mut self, name: impl Into<String>) -> Self {
        self.bind_as = Some(name.into());
        self
    }

    /// Name the step's values are bound under; defaults to the column name.
    pub fn binding_name(&self) -> &str {
        self.bind_as.as_deref().unwrap_or(&self.column)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetOperation {
    #[default]
    Union,
    Intersection,
}

/// What a set-mode relation does when a branch fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The lowest-index failure fails the relation
    #[default]
    FailFast,
    /// Failed branches are dropped with a warning
    BestEffort,
}

/// How the steps of a relation combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JoinMode {
    /// Steps run in order, each one feeding the next
    #[default]
    Sequence,
    /// Steps run concurrently and their values are combined
    Set {
        #[serde(default)]
        operation: SetOperation,
        #[serde(default)]
        failure_policy: FailurePolicy,
    },
}

/// A declared join: how to compute the value set that constrains a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRelation {
    pub id: String,
    pub steps: Vec<JoinStep>,
    #[serde(default)]
    pub mode: JoinMode,
}

/// Join request embedded in a search body under `"joins"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinDirective {
    pub relation: String,
    pub field: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Ok,
    Failed,
    /// Not run because an earlier sequence step came back empty
    Skipped,
}

/// Per-step execution report.
#[derive(Debug, Clone, Serialize)]
pub struct BranchReport {
    pub index: usize,
    pub query_id: String,
    pub source_id: String,
    pub row_count: usize,
    pub elapsed_ms: f64,
    pub status: BranchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of resolving one relation.
#[derive(Debug, Clone, Serialize)]
pub struct JoinOutcome {
    pub relation: String,
    /// Distinct join values, in priority order
    pub values: Vec<Value>,
    pub branches: Vec<BranchReport>,
    pub warnings: Vec<String>,
}

/// One directive as applied to a search body.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedJoin {
    pub relation: String,
    pub field: String,
    pub value_count: usize,
    pub branches: Vec<BranchReport>,
}

/// Metadata returned alongside a rewritten search body.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JoinMetadata {
    pub joins: Vec<AppliedJoin>,
    /// Total pipeline time in milliseconds
    pub total_time_ms: f64,
    pub warnings: Vec<String>,
}
