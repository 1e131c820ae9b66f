// SPDX-License-Identifier: Apache-2.0

//! Backend Registry
//!
//! Maps datasource type tags to executor factories.
//! New backends are added by registering a descriptor under their tag.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::executors::jdbc::normalize_connection_string;
use crate::engine::executors::{JdbcExecutor, MySqlExecutor, SearchEngineExecutor};
use crate::engine::params::ParameterDialect;
use crate::engine::traits::QueryExecutor;
use crate::engine::types::{ConnectionParams, QuerySpec};

/// Builds an executor for one query
pub type ExecutorFactory =
    fn(QuerySpec, Option<Arc<dyn CacheStore>>) -> EngineResult<Arc<dyn QueryExecutor>>;

/// How to build executors for one datasource type
#[derive(Clone)]
pub struct BackendDescriptor {
    pub tag: String,
    /// Quoting rules for template parameters in this backend's queries
    pub dialect: ParameterDialect,
    pub factory: ExecutorFactory,
}

impl BackendDescriptor {
    pub fn new(tag: impl Into<String>, dialect: ParameterDialect, factory: ExecutorFactory) -> Self {
        Self {
            tag: tag.into(),
            dialect,
            factory,
        }
    }
}

/// Registry that holds all available backend types
pub struct BackendRegistry {
    backends: HashMap<String, BackendDescriptor>,
}

impl BackendRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Registry with the built-in backends
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(BackendDescriptor::new("search", ParameterDialect::Json, search_factory));
        registry.register(BackendDescriptor::new(
            "elasticsearch",
            ParameterDialect::Json,
            search_factory,
        ));
        registry.register(BackendDescriptor::new("jdbc", ParameterDialect::Sql, jdbc_factory));
        registry.register(BackendDescriptor::new("mysql", ParameterDialect::MySql, mysql_factory));
        registry
    }

    /// Registers a backend, replacing any previous one with the same tag
    pub fn register(&mut self, descriptor: BackendDescriptor) {
        self.backends.insert(descriptor.tag.clone(), descriptor);
    }

    pub fn get(&self, tag: &str) -> Option<&BackendDescriptor> {
        self.backends.get(tag)
    }

    /// Parameter dialect for a backend type
    pub fn dialect(&self, tag: &str) -> EngineResult<ParameterDialect> {
        self.get(tag)
            .map(|d| d.dialect)
            .ok_or_else(|| EngineError::unknown_backend(tag))
    }

    /// Parameter dialect for one datasource
    ///
    /// SQL backends reached through a connection string take the MySQL
    /// dialect when the string points at MySQL or MariaDB.
    pub fn dialect_for(
        &self,
        tag: &str,
        connection: &ConnectionParams,
    ) -> EngineResult<ParameterDialect> {
        let dialect = self.dialect(tag)?;
        let mysql_url = connection.url.as_deref().is_some_and(is_mysql_url);
        Ok(match dialect {
            ParameterDialect::Sql if mysql_url => ParameterDialect::MySql,
            other => other,
        })
    }

    /// Builds the executor for `spec` using its datasource type
    pub fn create(
        &self,
        spec: QuerySpec,
        cache: Option<Arc<dyn CacheStore>>,
    ) -> EngineResult<Arc<dyn QueryExecutor>> {
        let descriptor = self
            .get(&spec.datasource.kind)
            .ok_or_else(|| EngineError::unknown_backend(spec.datasource.kind.clone()))?;
        (descriptor.factory)(spec, cache)
    }

    /// Lists all registered tags, sorted
    pub fn list(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.backends.keys().map(|s| s.as_str()).collect();
        tags.sort_unstable();
        tags
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn is_mysql_url(url: &str) -> bool {
    let scheme = normalize_connection_string(url)
        .split(':')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    scheme == "mysql" || scheme == "mariadb"
}

fn search_factory(
    spec: QuerySpec,
    cache: Option<Arc<dyn CacheStore>>,
) -> EngineResult<Arc<dyn QueryExecutor>> {
    Ok(Arc::new(SearchEngineExecutor::new(spec, cache)?))
}

fn jdbc_factory(
    spec: QuerySpec,
    cache: Option<Arc<dyn CacheStore>>,
) -> EngineResult<Arc<dyn QueryExecutor>> {
    Ok(Arc::new(JdbcExecutor::new(spec, cache)?))
}

fn mysql_factory(
    spec: QuerySpec,
    cache: Option<Arc<dyn CacheStore>>,
) -> EngineResult<Arc<dyn QueryExecutor>> {
    Ok(Arc::new(MySqlExecutor::new(spec, cache)?))
}
