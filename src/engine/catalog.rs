// SPDX-License-Identifier: Apache-2.0

//! Query catalog: configured query ids mapped to ready executors.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::QueryExecutor;

#[derive(Default, Clone)]
pub struct QueryCatalog {
    executors: HashMap<String, Arc<dyn QueryExecutor>>,
}

impl QueryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an executor under its query id, replacing any previous one.
    pub fn insert(&mut self, executor: Arc<dyn QueryExecutor>) {
        let id = executor.spec().id.clone();
        self.executors.insert(id, executor);
    }

    pub fn get(&self, query_id: &str) -> EngineResult<Arc<dyn QueryExecutor>> {
        self.executors
            .get(query_id)
            .cloned()
            .ok_or_else(|| EngineError::query_not_found(query_id))
    }

    pub fn contains(&self, query_id: &str) -> bool {
        self.executors.contains_key(query_id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
