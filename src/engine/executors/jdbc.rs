// SPDX-License-Identifier: Apache-2.0

//! JDBC-style executor
//!
//! Runs satellite queries against any SQL source reachable through a
//! connection string (`jdbc:postgresql://...`, `mysql://...`). Uses the SQLx
//! `Any` driver so the backend is chosen by the URL scheme.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlparser::dialect::GenericDialect;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Row};
use tokio::sync::OnceCell;
use tracing::info;

use crate::cache::CacheStore;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::executors::sql::{ensure_read_only, redact_connection_url};
use crate::engine::traits::QueryExecutor;
use crate::engine::types::{Binding, QuerySpec, RawResponse, Value};
use crate::observability::Sensitive;

const DEFAULT_POOL_SIZE: u32 = 5;
const ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Executor for connection-string driven SQL sources
pub struct JdbcExecutor {
    spec: QuerySpec,
    cache: Option<Arc<dyn CacheStore>>,
    connection_string: Sensitive<String>,
    pool: OnceCell<AnyPool>,
}

impl JdbcExecutor {
    pub fn new(spec: QuerySpec, cache: Option<Arc<dyn CacheStore>>) -> EngineResult<Self> {
        let raw = spec.datasource.connection.url.as_deref().ok_or_else(|| {
            EngineError::configuration(format!(
                "Datasource '{}' needs a connection string (connection.url)",
                spec.datasource.id
            ))
        })?;

        let connection_string = Sensitive::new(normalize_connection_string(raw));

        Ok(Self {
            spec,
            cache,
            connection_string,
            pool: OnceCell::new(),
        })
    }

    async fn pool(&self) -> EngineResult<&AnyPool> {
        self.pool
            .get_or_try_init(|| async {
                sqlx::any::install_default_drivers();

                let source = &self.spec.datasource;
                let max_connections = source
                    .connection
                    .pool_max_connections
                    .unwrap_or(DEFAULT_POOL_SIZE);

                let pool = AnyPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
                    .connect(self.connection_string.expose())
                    .await
                    .map_err(|e| classify_connect_error(&source.id, e))?;

                info!(
                    source = %source.id,
                    target = %self.connection_identity(),
                    max_connections,
                    "JDBC pool ready"
                );
                Ok::<_, EngineError>(pool)
            })
            .await
    }

    /// Converts a SQLx `Any` row to a binding keyed by column name
    fn convert_row(row: &AnyRow) -> Binding {
        row.columns()
            .iter()
            .map(|col| (col.name().to_string(), Self::extract_value(row, col.ordinal())))
            .collect()
    }

    /// Extracts a value from an `Any` row, trying the portable types in turn
    fn extract_value(row: &AnyRow, idx: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }

        Value::Null
    }
}

#[async_trait]
impl QueryExecutor for JdbcExecutor {
    fn backend_id(&self) -> &'static str {
        "jdbc"
    }

    fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    fn cache(&self) -> Option<&Arc<dyn CacheStore>> {
        self.cache.as_ref()
    }

    fn connection_identity(&self) -> String {
        redact_connection_url(self.connection_string.expose())
    }

    async fn initialize(&self) -> EngineResult<()> {
        self.pool().await.map(|_| ())
    }

    async fn execute_raw(&self, query: &str, _variable_binding: &str) -> EngineResult<RawResponse> {
        let source_id = &self.spec.datasource.id;
        ensure_read_only(source_id, query, &GenericDialect {})?;

        let pool = self.pool().await?;
        let rows: Vec<AnyRow> = sqlx::query(query)
            .fetch_all(pool)
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("syntax") {
                    EngineError::syntax_error(source_id, msg)
                } else {
                    EngineError::execution_error(source_id, msg)
                }
            })?;

        Ok(RawResponse::Rows(rows.iter().map(Self::convert_row).collect()))
    }
}

/// Turns a JDBC URL into one SQLx understands (`jdbc:mysql://` → `mysql://`).
pub fn normalize_connection_string(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("jdbc:")
        .unwrap_or(trimmed)
        .to_string()
}

fn classify_connect_error(source_id: &str, e: sqlx::Error) -> EngineError {
    let msg = e.to_string();
    if msg.contains("password authentication failed") || msg.contains("Access denied") {
        EngineError::auth_failed(source_id, msg)
    } else {
        EngineError::connection_failed(source_id, msg)
    }
}
