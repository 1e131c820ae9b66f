// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for the join engine
//!
//! Backend-specific failures are mapped to these variants so the planner and
//! the join engine can attribute every failure to the datasource it came from.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all join engine operations
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("Connection to '{source_id}' failed: {message}")]
    ConnectionError { source_id: String, message: String },

    #[error("Authentication to '{source_id}' failed: {message}")]
    AuthenticationFailed { source_id: String, message: String },

    #[error("Query on '{source_id}' failed: {message}")]
    ExecutionError { source_id: String, message: String },

    #[error("Query syntax error on '{source_id}': {message}")]
    SyntaxError { source_id: String, message: String },

    #[error("Query on '{source_id}' timed out after {timeout_ms}ms")]
    Timeout { source_id: String, timeout_ms: u64 },

    #[error("Join '{relation}' failed at branch {branch} ({source_id}): {message}")]
    JoinError {
        relation: String,
        branch: usize,
        source_id: String,
        message: String,
    },

    #[error("Cache error: {message}")]
    CacheError { message: String },

    #[error("Unknown datasource type: {kind}")]
    UnknownBackend { kind: String },

    #[error("Query not found: {query_id}")]
    QueryNotFound { query_id: String },

    #[error("Relation not found: {relation}")]
    RelationNotFound { relation: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn connection_failed(source_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ConnectionError {
            source_id: source_id.into(),
            message: msg.into(),
        }
    }

    pub fn auth_failed(source_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            source_id: source_id.into(),
            message: msg.into(),
        }
    }

    pub fn execution_error(source_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ExecutionError {
            source_id: source_id.into(),
            message: msg.into(),
        }
    }

    pub fn syntax_error(source_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SyntaxError {
            source_id: source_id.into(),
            message: msg.into(),
        }
    }

    pub fn timeout(source_id: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            source_id: source_id.into(),
            timeout_ms,
        }
    }

    /// Wraps a branch failure so it names the relation and branch it came from.
    pub fn join(
        relation: impl Into<String>,
        branch: usize,
        source_id: impl Into<String>,
        cause: &EngineError,
    ) -> Self {
        Self::JoinError {
            relation: relation.into(),
            branch,
            source_id: source_id.into(),
            message: cause.to_string(),
        }
    }

    pub fn cache(msg: impl Into<String>) -> Self {
        Self::CacheError { message: msg.into() }
    }

    pub fn unknown_backend(kind: impl Into<String>) -> Self {
        Self::UnknownBackend { kind: kind.into() }
    }

    pub fn query_not_found(id: impl Into<String>) -> Self {
        Self::QueryNotFound { query_id: id.into() }
    }

    pub fn relation_not_found(id: impl Into<String>) -> Self {
        Self::RelationNotFound {
            relation: id.into(),
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration { message: msg.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError { message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    /// Returns the datasource this error is attributed to, if any.
    pub fn source_id(&self) -> Option<&str> {
        match self {
            Self::ConnectionError { source_id, .. }
            | Self::AuthenticationFailed { source_id, .. }
            | Self::ExecutionError { source_id, .. }
            | Self::SyntaxError { source_id, .. }
            | Self::Timeout { source_id, .. }
            | Self::JoinError { source_id, .. } => Some(source_id),
            _ => None,
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
