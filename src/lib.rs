// joinery - Federated join engine
// Core library

pub mod cache;
pub mod config;
pub mod engine;
pub mod federation;
pub mod metrics;
pub mod observability;

use std::sync::Arc;

use tracing::info;

use cache::CacheStore;
use config::FederationConfig;
use engine::error::EngineResult;
use engine::{BackendRegistry, QueryCatalog};
use federation::JoinEngine;

/// Everything a proxy needs to serve joined searches.
pub struct AppState {
    pub registry: Arc<BackendRegistry>,
    pub cache: Arc<dyn CacheStore>,
    pub engine: Arc<JoinEngine>,
}

impl AppState {
    /// Wires the default backends, the configured cache and the join engine.
    pub fn from_config(config: &FederationConfig) -> EngineResult<Self> {
        Self::with_registry(config, BackendRegistry::with_defaults())
    }

    /// Same as `from_config`, with a caller-provided backend registry.
    pub fn with_registry(config: &FederationConfig, registry: BackendRegistry) -> EngineResult<Self> {
        config.validate()?;

        let cache = config.cache.build_store()?;
        let catalog = build_catalog(config, &registry, &cache)?;
        let engine = JoinEngine::new(catalog, config.relations.clone())
            .with_join_timeout_ms(config.join_timeout_ms);

        info!(
            backends = ?registry.list(),
            cache = cache.store_id(),
            relations = config.relations.len(),
            "Join engine ready"
        );

        Ok(Self {
            registry: Arc::new(registry),
            cache,
            engine: Arc::new(engine),
        })
    }

    /// Rebuilds queries and relations from `config` and swaps them in.
    ///
    /// The cache store and registry are kept.
    pub fn reload(&self, config: &FederationConfig) -> EngineResult<()> {
        config.validate()?;
        let catalog = build_catalog(config, &self.registry, &self.cache)?;
        self.engine.reload(catalog, config.relations.clone());
        Ok(())
    }
}

fn build_catalog(
    config: &FederationConfig,
    registry: &BackendRegistry,
    cache: &Arc<dyn CacheStore>,
) -> EngineResult<QueryCatalog> {
    let datasources = config.build_datasources(registry)?;
    let mut catalog = QueryCatalog::new();
    for spec in config.build_queries(&datasources)? {
        catalog.insert(registry.create(spec, Some(Arc::clone(cache)))?);
    }
    Ok(catalog)
}
