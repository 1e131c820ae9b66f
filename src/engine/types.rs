// SPDX-License-Identifier: Apache-2.0

//! Universal data types for the join engine
//!
//! These types give every backend the same shape for query descriptions,
//! per-request context and normalized results.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::params::{ParameterDialect, PopulateParameters, TemplateParameters};
use crate::observability::Sensitive;

/// Default lifetime of a cached result when the datasource sets none.
pub const DEFAULT_CACHE_MAX_AGE_SECS: u64 = 600;

/// Universal value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Array(Vec<Value>),
    Json(serde_json::Value),
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

impl Value {
    /// Converts a JSON document node into a `Value`.
    ///
    /// Scalars map onto the matching variant, arrays recurse and objects are
    /// kept as `Json`.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            obj @ serde_json::Value::Object(_) => Value::Json(obj),
        }
    }

    /// Converts the value into the JSON node used in search request bodies.
    pub fn to_json(&self) -> serde_json::Value {
        use base64::{engine::general_purpose::STANDARD, Engine};

        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(STANDARD.encode(b)),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Json(j) => j.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical text form used to compare join values across backends.
    ///
    /// `Int(7)` and `Text("7")` share the form `7`, so an id read from a SQL
    /// column matches the same id read from a search hit.
    pub fn canonical_text(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => "null".to_string(),
            other => other.to_json().to_string(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Removes duplicates (by canonical text) while keeping first-seen order.
pub fn distinct_values(values: impl IntoIterator<Item = Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|v| seen.insert(v.canonical_text()))
        .collect()
}

/// One row of a satellite query result, keyed by column or field name
pub type Binding = BTreeMap<String, Value>;

/// Normalized result of one query execution
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultSet {
    pub bindings: Vec<Binding>,
}

impl ResultSet {
    pub fn new(bindings: Vec<Binding>) -> Self {
        Self { bindings }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn truncate(&mut self, max_rows: usize) {
        self.bindings.truncate(max_rows);
    }

    /// Non-null values of `column`, in row order.
    pub fn column_values(&self, column: &str) -> Vec<Value> {
        self.bindings
            .iter()
            .filter_map(|row| row.get(column))
            .filter(|v| !v.is_null())
            .cloned()
            .collect()
    }

    /// Distinct non-null values of `column`, in first-seen order.
    pub fn distinct_column_values(&self, column: &str) -> Vec<Value> {
        distinct_values(self.column_values(column))
    }
}

/// What a backend hands back before normalization
#[derive(Debug, Clone)]
pub enum RawResponse {
    /// Rows already decoded by a SQL driver
    Rows(Vec<Binding>),
    /// A JSON response document (search clusters, HTTP backends)
    Document(serde_json::Value),
}

/// Deterministic fingerprint used as the result cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend connection parameters
///
/// Which fields matter depends on the datasource type: search clusters use
/// `url` + `index`, JDBC-style sources use `url` as the connection string,
/// native SQL drivers use `host`/`port`/`database`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub index: Option<String>,
    pub username: Option<String>,
    pub password: Option<Sensitive<String>>,
    pub ssl: bool,
    pub pool_max_connections: Option<u32>,
}

/// A configured backend, shared read-only by every executor that targets it
#[derive(Debug, Clone)]
pub struct DataSourceConfig {
    /// Datasource identifier, used to attribute errors and log lines
    pub id: String,
    /// Backend type tag (e.g., "search", "jdbc", "mysql")
    pub kind: String,
    pub connection: ConnectionParams,
    pub cache_enabled: bool,
    /// Lifetime of cached results (default: 600s)
    pub cache_max_age_secs: Option<u64>,
    /// Per round-trip timeout, none = wait for the backend
    pub timeout_ms: Option<u64>,
    /// Row cap applied to normalized results
    pub max_results: Option<usize>,
    /// Fills template placeholders for this backend's query language
    pub parameters: Arc<dyn PopulateParameters>,
}

impl DataSourceConfig {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, connection: ConnectionParams) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            connection,
            cache_enabled: true,
            cache_max_age_secs: None,
            timeout_ms: None,
            max_results: None,
            parameters: Arc::new(TemplateParameters::new(ParameterDialect::Json)),
        }
    }

    pub fn with_caching(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_cache_max_age(mut self, secs: u64) -> Self {
        self.cache_max_age_secs = Some(secs);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn with_parameters(mut self, parameters: Arc<dyn PopulateParameters>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs.unwrap_or(DEFAULT_CACHE_MAX_AGE_SECS))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Declarative description of one satellite query
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub id: String,
    /// Guard query; empty means the query always runs
    pub activation_query: String,
    /// Templated query text sent to the backend
    pub result_query: String,
    pub datasource: Arc<DataSourceConfig>,
}

impl QuerySpec {
    pub fn new(
        id: impl Into<String>,
        result_query: impl Into<String>,
        datasource: Arc<DataSourceConfig>,
    ) -> Self {
        Self {
            id: id.into(),
            activation_query: String::new(),
            result_query: result_query.into(),
            datasource,
        }
    }

    pub fn with_activation_query(mut self, activation_query: impl Into<String>) -> Self {
        self.activation_query = activation_query.into();
        self
    }
}

/// Per-request execution data
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub request_id: Uuid,
    /// Caller identity (username); `None` for anonymous callers
    pub identity: Option<String>,
    /// User-supplied template variables
    pub variables: HashMap<String, Value>,
    /// Caller asked to bypass cached results
    pub force_refresh: bool,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            identity: None,
            variables: HashMap::new(),
            force_refresh: false,
        }
    }

    pub fn for_user(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            ..Self::new()
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    /// Identity used in cache keys; anonymous callers share the empty identity.
    pub fn identity(&self) -> &str {
        self.identity.as_deref().unwrap_or("")
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}
