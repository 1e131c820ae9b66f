// SPDX-License-Identifier: Apache-2.0

//! Engine configuration
//!
//! Datasources, queries and relations are read from a JSON document. A few
//! deployment knobs can be overridden from the environment.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::{memory::DEFAULT_MAX_ENTRIES, CacheStore, MemoryCacheStore, RedisCacheStore};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::params::TemplateParameters;
use crate::engine::registry::BackendRegistry;
use crate::engine::types::{ConnectionParams, DataSourceConfig, QuerySpec, Value};
use crate::federation::types::{JoinRelation, DEFAULT_JOIN_TIMEOUT_MS};
use crate::observability::Sensitive;

pub const ENV_CACHE_BACKEND: &str = "JOINERY_CACHE_BACKEND";
pub const ENV_REDIS_URL: &str = "JOINERY_REDIS_URL";
pub const ENV_CACHE_TTL_SECS: &str = "JOINERY_CACHE_TTL_SECS";
pub const ENV_JOIN_TIMEOUT_MS: &str = "JOINERY_JOIN_TIMEOUT_MS";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

impl std::str::FromStr for CacheBackend {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(EngineError::configuration(format!(
                "Unknown cache backend '{other}' (expected memory or redis)"
            ))),
        }
    }
}

/// Result cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    /// Entry cap for the memory backend
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
    /// TTL for datasources that set no `cache_max_age_secs`
    #[serde(default)]
    pub default_ttl_secs: Option<u64>,
    #[serde(default)]
    pub redis_url: Option<Sensitive<String>>,
    /// Key namespace for the redis backend
    #[serde(default)]
    pub key_prefix: Option<String>,
}

fn default_max_entries() -> u64 {
    DEFAULT_MAX_ENTRIES
}

fn default_true() -> bool {
    true
}

fn default_join_timeout_ms() -> u64 {
    DEFAULT_JOIN_TIMEOUT_MS
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            max_entries: DEFAULT_MAX_ENTRIES,
            default_ttl_secs: None,
            redis_url: None,
            key_prefix: None,
        }
    }
}

impl CacheConfig {
    pub fn build_store(&self) -> EngineResult<Arc<dyn CacheStore>> {
        match self.backend {
            CacheBackend::Memory => Ok(Arc::new(MemoryCacheStore::new(self.max_entries))),
            CacheBackend::Redis => {
                let url = self.redis_url.as_ref().ok_or_else(|| {
                    EngineError::configuration("cache.redis_url is required for the redis backend")
                })?;
                let mut store = RedisCacheStore::new(url.expose())?;
                if let Some(prefix) = &self.key_prefix {
                    store = store.with_prefix(prefix.clone());
                }
                Ok(Arc::new(store))
            }
        }
    }
}

/// A configured backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceEntry {
    pub id: String,
    /// Backend type tag (e.g., "search", "jdbc", "mysql")
    pub kind: String,
    #[serde(default)]
    pub connection: ConnectionParams,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default)]
    pub cache_max_age_secs: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_results: Option<usize>,
    /// Default template parameter values
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

/// A satellite query bound to a datasource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEntry {
    pub id: String,
    pub datasource: String,
    #[serde(default)]
    pub activation_query: String,
    pub result_query: String,
}

/// Root configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub datasources: Vec<DataSourceEntry>,
    #[serde(default)]
    pub queries: Vec<QueryEntry>,
    #[serde(default)]
    pub relations: Vec<JoinRelation>,
    /// Bound on resolving every join of one search body
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            datasources: Vec::new(),
            queries: Vec::new(),
            relations: Vec::new(),
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
        }
    }
}

impl FederationConfig {
    /// Reads, applies environment overrides and validates a config file.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::configuration(format!("Failed to read {}: {e}", path.display()))
        })?;

        let mut config = Self::from_json(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        info!(
            path = %path.display(),
            datasources = config.datasources.len(),
            queries = config.queries.len(),
            relations = config.relations.len(),
            cache = ?config.cache.backend,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parses a config document without validating it.
    pub fn from_json(content: &str) -> EngineResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| EngineError::configuration(format!("Invalid configuration: {e}")))
    }

    /// Applies the `JOINERY_*` overrides found through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> EngineResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup(ENV_CACHE_BACKEND) {
            self.cache.backend = backend.parse()?;
        }
        if let Some(url) = lookup(ENV_REDIS_URL) {
            self.cache.redis_url = Some(Sensitive::new(url));
        }
        if let Some(ttl) = lookup(ENV_CACHE_TTL_SECS) {
            self.cache.default_ttl_secs = Some(parse_number(ENV_CACHE_TTL_SECS, &ttl)?);
        }
        if let Some(timeout) = lookup(ENV_JOIN_TIMEOUT_MS) {
            self.join_timeout_ms = parse_number(ENV_JOIN_TIMEOUT_MS, &timeout)?;
        }
        Ok(())
    }

    /// Structural checks: unique ids and references that resolve.
    pub fn validate(&self) -> EngineResult<()> {
        let datasource_ids = unique_ids("datasource", self.datasources.iter().map(|d| d.id.as_str()))?;
        let query_ids = unique_ids("query", self.queries.iter().map(|q| q.id.as_str()))?;
        unique_ids("relation", self.relations.iter().map(|r| r.id.as_str()))?;

        for query in &self.queries {
            if !datasource_ids.contains(query.datasource.as_str()) {
                return Err(EngineError::configuration(format!(
                    "Query '{}' references unknown datasource '{}'",
                    query.id, query.datasource
                )));
            }
        }

        for relation in &self.relations {
            if relation.steps.is_empty() {
                return Err(EngineError::configuration(format!(
                    "Relation '{}' has no steps",
                    relation.id
                )));
            }
            for step in &relation.steps {
                if !query_ids.contains(step.query.as_str()) {
                    return Err(EngineError::configuration(format!(
                        "Relation '{}' references unknown query '{}'",
                        relation.id, step.query
                    )));
                }
                if step.column.trim().is_empty() {
                    return Err(EngineError::configuration(format!(
                        "Relation '{}' has a step without a column",
                        relation.id
                    )));
                }
            }
        }

        if self.cache.backend == CacheBackend::Redis && self.cache.redis_url.is_none() {
            return Err(EngineError::configuration(
                "cache.redis_url is required for the redis backend",
            ));
        }

        if self.join_timeout_ms == 0 {
            return Err(EngineError::configuration("join_timeout_ms must be positive"));
        }

        Ok(())
    }

    /// Builds shared datasource configs, with parameter quoting chosen by backend type.
    pub fn build_datasources(
        &self,
        registry: &BackendRegistry,
    ) -> EngineResult<HashMap<String, Arc<DataSourceConfig>>> {
        self.datasources
            .iter()
            .map(|entry| {
                let dialect = registry.dialect_for(&entry.kind, &entry.connection)?;
                let defaults = entry
                    .parameters
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v.clone())))
                    .collect();

                let mut source =
                    DataSourceConfig::new(entry.id.clone(), entry.kind.clone(), entry.connection.clone())
                        .with_caching(entry.cache_enabled)
                        .with_parameters(Arc::new(
                            TemplateParameters::new(dialect).with_defaults(defaults),
                        ));
                source.cache_max_age_secs = entry.cache_max_age_secs.or(self.cache.default_ttl_secs);
                source.timeout_ms = entry.timeout_ms;
                source.max_results = entry.max_results;

                Ok((entry.id.clone(), Arc::new(source)))
            })
            .collect()
    }

    /// Query specs bound to their datasources.
    pub fn build_queries(
        &self,
        datasources: &HashMap<String, Arc<DataSourceConfig>>,
    ) -> EngineResult<Vec<QuerySpec>> {
        self.queries
            .iter()
            .map(|entry| {
                let source = datasources.get(&entry.datasource).ok_or_else(|| {
                    EngineError::configuration(format!(
                        "Query '{}' references unknown datasource '{}'",
                        entry.id, entry.datasource
                    ))
                })?;
                Ok(QuerySpec::new(entry.id.clone(), entry.result_query.clone(), Arc::clone(source))
                    .with_activation_query(entry.activation_query.clone()))
            })
            .collect()
    }
}

fn unique_ids<'a>(
    kind: &str,
    ids: impl Iterator<Item = &'a str>,
) -> EngineResult<HashSet<&'a str>> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            return Err(EngineError::configuration(format!("Empty {kind} id")));
        }
        if !seen.insert(id) {
            return Err(EngineError::configuration(format!("Duplicate {kind} id '{id}'")));
        }
    }
    Ok(seen)
}

fn parse_number(key: &str, raw: &str) -> EngineResult<u64> {
    raw.trim()
        .parse()
        .map_err(|_| EngineError::configuration(format!("{key} must be a number, got '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::ExecutionContext;
    use crate::federation::types::{FailurePolicy, JoinMode, SetOperation};

    const SAMPLE: &str = r#"{
        "cache": {"backend": "memory", "max_entries": 100, "default_ttl_secs": 120},
        "datasources": [
            {
                "id": "crm",
                "kind": "mysql",
                "connection": {"host": "db", "database": "crm", "username": "reader", "password": "s3cret"},
                "cache_max_age_secs": 30,
                "parameters": {"region": "emea"}
            },
            {
                "id": "search",
                "kind": "search",
                "connection": {"url": "http://localhost:9200", "index": "companies"},
                "cache_enabled": false
            }
        ],
        "queries": [
            {"id": "companies", "datasource": "crm", "result_query": "SELECT id FROM companies WHERE region = @region@"},
            {"id": "hits", "datasource": "search", "result_query": "{\"query\": {\"match_all\": {}}}"}
        ],
        "relations": [
            {"id": "company_docs", "steps": [{"query": "companies", "column": "id"}]},
            {
                "id": "both",
                "steps": [{"query": "companies", "column": "id"}, {"query": "hits", "column": "company_id"}],
                "mode": {"type": "set", "operation": "intersection", "failure_policy": "best_effort"}
            }
        ]
    }"#;

    #[test]
    fn parses_sample_document() {
        let config = FederationConfig::from_json(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.cache.max_entries, 100);
        assert_eq!(config.join_timeout_ms, DEFAULT_JOIN_TIMEOUT_MS);
        assert!(config.datasources[0].cache_enabled);
        assert!(!config.datasources[1].cache_enabled);
        assert_eq!(config.queries[0].activation_query, "");
        assert_eq!(
            config.relations[1].mode,
            JoinMode::Set {
                operation: SetOperation::Intersection,
                failure_policy: FailurePolicy::BestEffort,
            }
        );
        assert!(!format!("{:?}", config.datasources[0].connection).contains("s3cret"));
    }

    #[test]
    fn builds_datasources_with_backend_dialect() {
        let config = FederationConfig::from_json(SAMPLE).unwrap();
        let registry = BackendRegistry::with_defaults();
        let sources = config.build_datasources(&registry).unwrap();

        let crm = &sources["crm"];
        assert_eq!(crm.cache_max_age_secs, Some(30));
        let populated = crm
            .parameters
            .populate(&config.queries[0].result_query, &ExecutionContext::new())
            .unwrap();
        assert_eq!(populated, "SELECT id FROM companies WHERE region = 'emea'");

        // MySQL sources treat backslash as an escape character.
        let ctx = ExecutionContext::new().with_variable("region", crate::engine::types::Value::from(r"a\b"));
        let populated = crm
            .parameters
            .populate(&config.queries[0].result_query, &ctx)
            .unwrap();
        assert_eq!(populated, r"SELECT id FROM companies WHERE region = 'a\\b'");

        // Falls back to the cache-wide default TTL.
        assert_eq!(sources["search"].cache_max_age_secs, Some(120));

        let specs = config.build_queries(&sources).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].datasource.id, "search");
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut config = FederationConfig::from_json(SAMPLE).unwrap();
        let copy = config.queries[0].clone();
        config.queries.push(copy);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate query id 'companies'"));
    }

    #[test]
    fn rejects_dangling_references() {
        let mut config = FederationConfig::from_json(SAMPLE).unwrap();
        config.queries[0].datasource = "nope".into();
        assert!(config.validate().is_err());

        let mut config = FederationConfig::from_json(SAMPLE).unwrap();
        config.relations[0].steps[0].query = "ghost".into();
        assert!(config.validate().unwrap_err().to_string().contains("ghost"));

        let mut config = FederationConfig::from_json(SAMPLE).unwrap();
        config.relations[0].steps.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_backend_fails_at_build() {
        let mut config = FederationConfig::from_json(SAMPLE).unwrap();
        config.datasources[0].kind = "sparql".into();

        let err = config
            .build_datasources(&BackendRegistry::with_defaults())
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownBackend { .. }));
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = FederationConfig::from_json(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_CACHE_BACKEND, "redis"),
            (ENV_REDIS_URL, "redis://cache:6379/1"),
            (ENV_CACHE_TTL_SECS, "900"),
            (ENV_JOIN_TIMEOUT_MS, "5000"),
        ]);

        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        config.validate().unwrap();

        assert_eq!(config.cache.backend, CacheBackend::Redis);
        assert_eq!(config.cache.default_ttl_secs, Some(900));
        assert_eq!(config.join_timeout_ms, 5000);
        assert!(config.cache.build_store().is_ok());
    }

    #[test]
    fn bad_env_values_are_rejected() {
        let mut config = FederationConfig::default();
        assert!(config
            .apply_env_overrides(|key| (key == ENV_JOIN_TIMEOUT_MS).then(|| "soon".to_string()))
            .is_err());
        assert!(config
            .apply_env_overrides(|key| (key == ENV_CACHE_BACKEND).then(|| "disk".to_string()))
            .is_err());
    }

    #[test]
    fn redis_backend_needs_url() {
        let config = FederationConfig {
            cache: CacheConfig {
                backend: CacheBackend::Redis,
                ..CacheConfig::default()
            },
            ..FederationConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(config.cache.build_store().is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("joinery.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = FederationConfig::load(&path).unwrap();
        assert_eq!(config.queries.len(), 2);

        let missing = FederationConfig::load(&dir.path().join("absent.json"));
        assert!(matches!(missing, Err(EngineError::Configuration { .. })));
    }
}
