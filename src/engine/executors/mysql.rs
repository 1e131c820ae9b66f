// SPDX-License-Identifier: Apache-2.0

//! MySQL executor
//!
//! Runs satellite queries against MySQL/MariaDB with a native SQLx pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use sqlparser::dialect::MySqlDialect;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row};
use tokio::sync::OnceCell;
use tracing::info;

use crate::cache::CacheStore;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::executors::sql::{ensure_read_only, redact_connection_url};
use crate::engine::traits::QueryExecutor;
use crate::engine::types::{Binding, ConnectionParams, QuerySpec, RawResponse, Value};
use crate::observability::Sensitive;

const DEFAULT_PORT: u16 = 3306;
const DEFAULT_POOL_SIZE: u32 = 5;

/// MySQL executor implementation
pub struct MySqlExecutor {
    spec: QuerySpec,
    cache: Option<Arc<dyn CacheStore>>,
    connection_string: Sensitive<String>,
    pool: OnceCell<MySqlPool>,
}

impl MySqlExecutor {
    pub fn new(spec: QuerySpec, cache: Option<Arc<dyn CacheStore>>) -> EngineResult<Self> {
        let connection_string =
            Self::build_connection_string(&spec.datasource.id, &spec.datasource.connection)?;

        Ok(Self {
            spec,
            cache,
            connection_string: Sensitive::new(connection_string),
            pool: OnceCell::new(),
        })
    }

    /// Builds a connection string from config
    ///
    /// An explicit `url` wins; otherwise host, port, credentials and database
    /// are assembled into one.
    fn build_connection_string(source_id: &str, config: &ConnectionParams) -> EngineResult<String> {
        if let Some(url) = config.url.as_deref() {
            return Ok(url.trim().trim_start_matches("jdbc:").to_string());
        }

        let host = config.host.as_deref().ok_or_else(|| {
            EngineError::configuration(format!(
                "Datasource '{source_id}' needs connection.host or connection.url"
            ))
        })?;
        let port = config.port.unwrap_or(DEFAULT_PORT);
        let db = config.database.as_deref().unwrap_or("mysql");
        let ssl_mode = if config.ssl { "REQUIRED" } else { "DISABLED" };

        let user = config
            .username
            .as_deref()
            .map(Self::encode_userinfo_component)
            .unwrap_or_default();
        let userinfo = match config.password.as_ref() {
            Some(password) => format!(
                "{}:{}@",
                user,
                Self::encode_userinfo_component(password.expose())
            ),
            None if !user.is_empty() => format!("{user}@"),
            None => String::new(),
        };

        Ok(format!(
            "mysql://{userinfo}{host}:{port}/{db}?ssl-mode={ssl_mode}"
        ))
    }

    fn encode_userinfo_component(value: &str) -> String {
        utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
    }

    async fn pool(&self) -> EngineResult<&MySqlPool> {
        self.pool
            .get_or_try_init(|| async {
                let source = &self.spec.datasource;
                let max_connections = source
                    .connection
                    .pool_max_connections
                    .unwrap_or(DEFAULT_POOL_SIZE);

                let pool = MySqlPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(Duration::from_secs(30))
                    .connect(self.connection_string.expose())
                    .await
                    .map_err(|e| {
                        let msg = e.to_string();
                        if msg.contains("Access denied") {
                            EngineError::auth_failed(&source.id, msg)
                        } else {
                            EngineError::connection_failed(&source.id, msg)
                        }
                    })?;

                info!(source = %source.id, target = %self.connection_identity(), "MySQL pool ready");
                Ok::<_, EngineError>(pool)
            })
            .await
    }

    fn convert_row(mysql_row: &MySqlRow) -> Binding {
        mysql_row
            .columns()
            .iter()
            .map(|col| {
                (
                    col.name().to_string(),
                    Self::extract_value(mysql_row, col.ordinal()),
                )
            })
            .collect()
    }

    /// Extracts a value from a MySqlRow at the given index
    fn extract_value(row: &MySqlRow, idx: usize) -> Value {
        // BIGINT UNSIGNED first
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v.map(unsigned_value).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u32>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i8>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v
                .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }

        Value::Null
    }
}

/// `BIGINT UNSIGNED` values past `i64::MAX` keep their digits as text.
fn unsigned_value(u: u64) -> Value {
    i64::try_from(u)
        .map(Value::Int)
        .unwrap_or_else(|_| Value::Text(u.to_string()))
}

#[async_trait]
impl QueryExecutor for MySqlExecutor {
    fn backend_id(&self) -> &'static str {
        "mysql"
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
        ensure_read_only(source_id, query, &MySqlDialect {})?;

        let pool = self.pool().await?;
        let rows: Vec<MySqlRow> = sqlx::query(query).fetch_all(pool).await.map_err(|e| {
            let msg = e.to_string();
            // 1064 = ER_PARSE_ERROR
            if msg.contains("1064") || msg.contains("syntax") {
                EngineError::syntax_error(source_id, msg)
            } else {
                EngineError::execution_error(source_id, msg)
            }
        })?;

        Ok(RawResponse::Rows(rows.iter().map(Self::convert_row).collect()))
    }
}
