use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use joinery::cache::{self, CacheStore, MemoryCacheStore};
use joinery::config::FederationConfig;
use joinery::engine::error::{EngineError, EngineResult};
use joinery::engine::registry::{BackendDescriptor, BackendRegistry};
use joinery::engine::traits::QueryExecutor;
use joinery::engine::types::{
    Binding, CacheKey, ConnectionParams, DataSourceConfig, ExecutionContext, QuerySpec, RawResponse,
    ResultSet, Value,
};
use joinery::engine::ParameterDialect;
use joinery::AppState;

type KeyArgs = (String, String, bool, String, String);

/// Executor with a canned backend that records cache-key derivations.
struct RecordingExecutor {
    spec: QuerySpec,
    cache: Option<Arc<dyn CacheStore>>,
    raw: RawResponse,
    activation_rows: Vec<Binding>,
    delay: Duration,
    failing: AtomicBool,
    backend_calls: AtomicUsize,
    activation_calls: AtomicUsize,
    key_calls: Mutex<Vec<KeyArgs>>,
}

impl RecordingExecutor {
    fn new(source: DataSourceConfig, result_query: &str, raw: RawResponse) -> Self {
        Self {
            spec: QuerySpec::new("q", result_query, Arc::new(source)),
            cache: None,
            raw,
            activation_rows: Vec::new(),
            delay: Duration::ZERO,
            failing: AtomicBool::new(false),
            backend_calls: AtomicUsize::new(0),
            activation_calls: AtomicUsize::new(0),
            key_calls: Mutex::new(Vec::new()),
        }
    }

    fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn with_activation(mut self, query: &str, rows: Vec<Binding>) -> Self {
        self.spec = self.spec.with_activation_query(query);
        self.activation_rows = rows;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn backend_calls(&self) -> usize {
        self.backend_calls.load(Ordering::SeqCst)
    }

    fn key_calls(&self) -> Vec<KeyArgs> {
        self.key_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryExecutor for RecordingExecutor {
    fn backend_id(&self) -> &'static str {
        "recording"
    }

    fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    fn cache(&self) -> Option<&Arc<dyn CacheStore>> {
        self.cache.as_ref()
    }

    fn connection_identity(&self) -> String {
        "recording://warehouse/db".to_string()
    }

    fn generate_cache_key(
        &self,
        connection_identity: &str,
        result_query: &str,
        force_refresh: bool,
        variable_binding: &str,
        caller_identity: &str,
    ) -> CacheKey {
        self.key_calls.lock().unwrap().push((
            connection_identity.to_string(),
            result_query.to_string(),
            force_refresh,
            variable_binding.to_string(),
            caller_identity.to_string(),
        ));
        cache::fingerprint(
            connection_identity,
            result_query,
            force_refresh,
            variable_binding,
            caller_identity,
        )
    }

    async fn initialize(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn execute_raw(&self, query: &str, _variable_binding: &str) -> EngineResult<RawResponse> {
        if !self.spec.activation_query.is_empty() && query == self.spec.activation_query {
            self.activation_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(RawResponse::Rows(self.activation_rows.clone()));
        }

        self.backend_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::execution_error(self.source_id(), "warehouse unavailable"));
        }
        Ok(self.raw.clone())
    }
}

/// Cache store whose every operation fails.
struct BrokenCache;

#[async_trait]
impl CacheStore for BrokenCache {
    fn store_id(&self) -> &'static str {
        "broken"
    }

    async fn get(&self, _key: &CacheKey) -> EngineResult<Option<ResultSet>> {
        Err(EngineError::cache("connection reset"))
    }

    async fn set(&self, _key: &CacheKey, _value: &ResultSet, _ttl: Duration) -> EngineResult<()> {
        Err(EngineError::cache("connection reset"))
    }

    async fn invalidate(&self, _key: &CacheKey) -> EngineResult<()> {
        Err(EngineError::cache("connection reset"))
    }

    async fn clear(&self) -> EngineResult<()> {
        Err(EngineError::cache("connection reset"))
    }
}

fn warehouse() -> DataSourceConfig {
    DataSourceConfig::new("warehouse", "recording", ConnectionParams::default())
}

fn rows(ids: &[i64]) -> RawResponse {
    RawResponse::Rows(
        ids.iter()
            .map(|id| {
                Binding::from([
                    ("id".to_string(), Value::Int(*id)),
                    ("name".to_string(), Value::Text(format!("company-{id}"))),
                ])
            })
            .collect(),
    )
}

fn memory_cache() -> Arc<dyn CacheStore> {
    Arc::new(MemoryCacheStore::default())
}

#[tokio::test]
async fn unrecognized_raw_result_yields_empty_bindings() {
    let executor = RecordingExecutor::new(
        warehouse(),
        "select * from x",
        RawResponse::Document(json!({"result": {}})),
    );
    let ctx = ExecutionContext::for_user("fred");

    let results = executor.fetch_results(&ctx, false, "variableX").await.unwrap();

    assert_eq!(serde_json::to_value(&results).unwrap(), json!({"bindings": []}));
    assert_eq!(
        executor.key_calls(),
        vec![(
            "recording://warehouse/db".to_string(),
            "select * from x".to_string(),
            false,
            "variableX".to_string(),
            "fred".to_string(),
        )]
    );
}

#[tokio::test]
async fn non_empty_raw_result_gives_one_binding_per_row() {
    let executor = RecordingExecutor::new(warehouse(), "select * from x", rows(&[1, 2, 3]));
    let ctx = ExecutionContext::for_user("fred");

    let results = executor.fetch_results(&ctx, false, "variableX").await.unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results.bindings[1]["id"], Value::Int(2));
    assert_eq!(results.bindings[1]["name"], Value::from("company-2"));
    assert_eq!(executor.key_calls().len(), 1);
}

#[tokio::test]
async fn repeated_fetch_is_served_from_cache() {
    let executor =
        RecordingExecutor::new(warehouse(), "select id from companies", rows(&[1, 2]))
            .with_cache(memory_cache());
    let ctx = ExecutionContext::for_user("fred");

    let first = executor.fetch_results(&ctx, false, "id").await.unwrap();
    let second = executor.fetch_results(&ctx, false, "id").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(executor.backend_calls(), 1);
    assert_eq!(executor.key_calls().len(), 2);
}

#[tokio::test]
async fn force_refresh_always_reaches_backend() {
    let executor =
        RecordingExecutor::new(warehouse(), "select id from companies", rows(&[1]))
            .with_cache(memory_cache());
    let ctx = ExecutionContext::for_user("fred");

    executor.fetch_results(&ctx, true, "id").await.unwrap();
    executor.fetch_results(&ctx, true, "id").await.unwrap();

    assert_eq!(executor.backend_calls(), 2);
    assert!(executor.key_calls().iter().all(|args| args.2));
}

#[tokio::test]
async fn caller_identity_partitions_the_cache() {
    let executor =
        RecordingExecutor::new(warehouse(), "select id from companies", rows(&[1]))
            .with_cache(memory_cache());

    executor
        .fetch_results(&ExecutionContext::for_user("fred"), false, "id")
        .await
        .unwrap();
    executor
        .fetch_results(&ExecutionContext::for_user("wilma"), false, "id")
        .await
        .unwrap();
    executor
        .fetch_results(&ExecutionContext::new(), false, "id")
        .await
        .unwrap();

    assert_eq!(executor.backend_calls(), 3);
    assert_eq!(executor.key_calls()[2].4, "");
}

#[tokio::test]
async fn disabled_caching_skips_the_store() {
    let cache = memory_cache();
    let executor = RecordingExecutor::new(
        warehouse().with_caching(false),
        "select id from companies",
        rows(&[1]),
    )
    .with_cache(Arc::clone(&cache));
    let ctx = ExecutionContext::new();

    executor.fetch_results(&ctx, false, "id").await.unwrap();
    executor.fetch_results(&ctx, false, "id").await.unwrap();

    assert_eq!(executor.backend_calls(), 2);
}

#[tokio::test]
async fn inactive_query_returns_empty_without_running() {
    let executor = RecordingExecutor::new(warehouse(), "select id from companies", rows(&[1]))
        .with_cache(memory_cache())
        .with_activation("select 1 from feature_flags where enabled", vec![]);

    let results = executor
        .fetch_results(&ExecutionContext::new(), false, "id")
        .await
        .unwrap();

    assert!(results.is_empty());
    assert_eq!(executor.activation_calls.load(Ordering::SeqCst), 1);
    assert_eq!(executor.backend_calls(), 0);
    assert!(executor.key_calls().is_empty());
}

#[tokio::test]
async fn active_query_runs_when_activation_matches() {
    let flag = Binding::from([("enabled".to_string(), Value::Bool(true))]);
    let executor = RecordingExecutor::new(warehouse(), "select id from companies", rows(&[4]))
        .with_activation("select 1 from feature_flags where enabled", vec![flag]);

    let results = executor
        .fetch_results(&ExecutionContext::new(), false, "id")
        .await
        .unwrap();

    assert_eq!(results.column_values("id"), vec![Value::Int(4)]);
    assert_eq!(executor.backend_calls(), 1);
}

#[tokio::test]
async fn cache_failures_degrade_to_misses() {
    let executor = RecordingExecutor::new(warehouse(), "select id from companies", rows(&[1]))
        .with_cache(Arc::new(BrokenCache));
    let ctx = ExecutionContext::new();

    let first = executor.fetch_results(&ctx, false, "id").await.unwrap();
    let second = executor.fetch_results(&ctx, false, "id").await.unwrap();

    assert_eq!(first.len(), 1);
    assert_eq!(first, second);
    assert_eq!(executor.backend_calls(), 2);
}

#[tokio::test]
async fn backend_failures_are_not_cached() {
    let executor = RecordingExecutor::new(warehouse(), "select id from companies", rows(&[1]))
        .with_cache(memory_cache());
    let ctx = ExecutionContext::new();

    executor.failing.store(true, Ordering::SeqCst);
    let err = executor.fetch_results(&ctx, false, "id").await.unwrap_err();
    assert_eq!(err.source_id(), Some("warehouse"));

    executor.failing.store(false, Ordering::SeqCst);
    executor.fetch_results(&ctx, false, "id").await.unwrap();
    executor.fetch_results(&ctx, false, "id").await.unwrap();

    assert_eq!(executor.backend_calls(), 2);
}

#[tokio::test]
async fn slow_backend_times_out() {
    let executor = RecordingExecutor::new(
        warehouse().with_timeout_ms(20),
        "select id from companies",
        rows(&[1]),
    )
    .with_delay(Duration::from_millis(300));

    let err = executor
        .fetch_results(&ExecutionContext::new(), false, "id")
        .await
        .unwrap_err();

    match err {
        EngineError::Timeout {
            source_id,
            timeout_ms,
        } => {
            assert_eq!(source_id, "warehouse");
            assert_eq!(timeout_ms, 20);
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn max_results_caps_rows() {
    let executor = RecordingExecutor::new(
        warehouse().with_max_results(2),
        "select id from companies",
        rows(&[1, 2, 3, 4]),
    );

    let results = executor
        .fetch_results(&ExecutionContext::new(), false, "id")
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
}

#[tokio::test]
async fn populated_query_text_drives_the_key() {
    let executor = RecordingExecutor::new(
        warehouse(),
        r#"{"query": {"term": {"city": @city@}}}"#,
        rows(&[1]),
    );
    let ctx = ExecutionContext::new().with_variable("city", Value::from("Galway"));

    executor.fetch_results(&ctx, false, "id").await.unwrap();
    assert_eq!(
        executor.key_calls()[0].1,
        r#"{"query": {"term": {"city": "Galway"}}}"#
    );

    let err = executor
        .fetch_results(&ExecutionContext::new(), false, "id")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ValidationError { .. }));
}

// ─── Full pipeline ───────────────────────────────────────────

/// Backend that answers with the populated query text itself: a JSON array
/// becomes one `{"id": element}` row per element.
struct EchoExecutor {
    spec: QuerySpec,
    cache: Option<Arc<dyn CacheStore>>,
}

#[async_trait]
impl QueryExecutor for EchoExecutor {
    fn backend_id(&self) -> &'static str {
        "echo"
    }

    fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    fn cache(&self) -> Option<&Arc<dyn CacheStore>> {
        self.cache.as_ref()
    }

    fn connection_identity(&self) -> String {
        format!("echo://{}", self.spec.datasource.id)
    }

    async fn initialize(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn execute_raw(&self, query: &str, variable_binding: &str) -> EngineResult<RawResponse> {
        let parsed: serde_json::Value = serde_json::from_str(query)
            .map_err(|e| EngineError::syntax_error(self.source_id(), e.to_string()))?;
        let elements = parsed.as_array().cloned().unwrap_or_default();
        Ok(RawResponse::Rows(
            elements
                .into_iter()
                .map(|v| Binding::from([(variable_binding.to_string(), Value::from_json(v))]))
                .collect(),
        ))
    }
}

fn echo_factory(
    spec: QuerySpec,
    cache: Option<Arc<dyn CacheStore>>,
) -> EngineResult<Arc<dyn QueryExecutor>> {
    Ok(Arc::new(EchoExecutor { spec, cache }))
}

fn echo_registry() -> BackendRegistry {
    let mut registry = BackendRegistry::with_defaults();
    registry.register(BackendDescriptor::new("echo", ParameterDialect::Json, echo_factory));
    registry
}

const PIPELINE: &str = r#"{
    "datasources": [
        {"id": "crm", "kind": "echo"},
        {"id": "hr", "kind": "echo", "parameters": {"department": "sales"}}
    ],
    "queries": [
        {"id": "companies", "datasource": "crm", "result_query": "[3, 1, 3, 8]"},
        {"id": "filtered", "datasource": "crm", "result_query": "@company_ids@"},
        {"id": "staffed", "datasource": "hr", "result_query": "[1, 8, 42]"},
        {"id": "nobody", "datasource": "hr", "result_query": "[]"}
    ],
    "relations": [
        {
            "id": "company_chain",
            "steps": [
                {"query": "companies", "column": "company_id", "bind_as": "company_ids"},
                {"query": "filtered", "column": "company_id"}
            ]
        },
        {
            "id": "staffed_companies",
            "steps": [
                {"query": "companies", "column": "company_id"},
                {"query": "staffed", "column": "company_id"}
            ],
            "mode": {"type": "set", "operation": "intersection"}
        },
        {
            "id": "empty_chain",
            "steps": [
                {"query": "nobody", "column": "company_id"},
                {"query": "companies", "column": "company_id"}
            ]
        }
    ]
}"#;

#[tokio::test]
async fn app_state_wires_configured_relations() {
    let config = FederationConfig::from_json(PIPELINE).unwrap();
    let state = AppState::with_registry(&config, echo_registry()).unwrap();

    assert!(state.registry.list().contains(&"search"));
    assert!(state.registry.list().contains(&"echo"));
    assert_eq!(state.cache.store_id(), "memory");
    assert_eq!(
        state.engine.relation_ids(),
        vec!["company_chain", "empty_chain", "staffed_companies"]
    );
}

#[tokio::test]
async fn unknown_backend_in_config_is_rejected() {
    let config = FederationConfig::from_json(PIPELINE).unwrap();
    let err = AppState::from_config(&config).err().unwrap();
    assert!(matches!(err, EngineError::UnknownBackend { .. }));
}

#[tokio::test]
async fn search_body_is_rewritten_end_to_end() {
    let config = FederationConfig::from_json(PIPELINE).unwrap();
    let state = AppState::with_registry(&config, echo_registry()).unwrap();

    let body = json!({
        "query": {"match": {"title": "engineer"}},
        "size": 20,
        "joins": [
            {"relation": "company_chain", "field": "company_id"},
            {"relation": "staffed_companies", "field": "employer_id"},
            {"relation": "empty_chain", "field": "partner_id"}
        ]
    });

    let (rewritten, metadata) = state
        .engine
        .prepare_search(body, &ExecutionContext::for_user("fred"))
        .await
        .unwrap();

    assert!(rewritten.get("joins").is_none());
    assert_eq!(rewritten["size"], json!(20));
    assert_eq!(
        rewritten["query"]["bool"]["must"],
        json!([{"match": {"title": "engineer"}}])
    );

    let filters = rewritten["query"]["bool"]["filter"].as_array().unwrap();
    assert_eq!(filters.len(), 3);
    assert_eq!(filters[0]["terms"]["company_id"], json!([3, 1, 8]));
    assert_eq!(filters[0]["terms"]["_name"], json!("joinery:company_chain:company_id"));
    assert_eq!(filters[1]["terms"]["employer_id"], json!([1, 8]));
    assert_eq!(filters[2]["bool"]["must_not"], json!([{"match_all": {}}]));

    assert_eq!(metadata.joins.len(), 3);
    assert_eq!(metadata.joins[2].value_count, 0);
    assert_eq!(metadata.joins[2].branches.len(), 2);

    // Re-applying a join replaces its clause instead of adding another.
    let mut again = rewritten.clone();
    again["joins"] = json!([{"relation": "company_chain", "field": "company_id"}]);
    let (twice, _) = state
        .engine
        .prepare_search(again, &ExecutionContext::for_user("fred"))
        .await
        .unwrap();
    let filters = twice["query"]["bool"]["filter"].as_array().unwrap();
    assert_eq!(filters.len(), 3);
    let chain: Vec<_> = filters
        .iter()
        .filter(|c| c["terms"]["_name"] == json!("joinery:company_chain:company_id"))
        .collect();
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0]["terms"]["company_id"], json!([3, 1, 8]));
}

#[tokio::test]
async fn reload_replaces_relations() {
    let config = FederationConfig::from_json(PIPELINE).unwrap();
    let state = AppState::with_registry(&config, echo_registry()).unwrap();

    let mut next = config.clone();
    next.relations.retain(|r| r.id == "company_chain");
    state.reload(&next).unwrap();

    assert_eq!(state.engine.relation_ids(), vec!["company_chain"]);
    let err = state
        .engine
        .resolve_relation("empty_chain", &ExecutionContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RelationNotFound { .. }));
}
