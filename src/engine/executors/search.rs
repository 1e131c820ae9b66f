// SPDX-License-Identifier: Apache-2.0

//! Search-engine executor
//!
//! Sends populated JSON request bodies to an Elasticsearch-compatible
//! `_search` endpoint over HTTP. The variable binding names the field the
//! join needs, so it is used as the `_source` projection when the query
//! does not set one.

use std::sync::Arc;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value as JsonValue};
use tokio::sync::OnceCell;
use tracing::{debug, info};
use url::Url;

use crate::cache::CacheStore;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::QueryExecutor;
use crate::engine::types::{QuerySpec, RawResponse};
use crate::observability::Sensitive;

/// Characters left as-is in index names (`logs-*,metrics.2024`).
const INDEX_NAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'*')
    .remove(b',');

/// Field name whose values come back as hit metadata, never from `_source`.
const DOCUMENT_ID_FIELD: &str = "_id";

pub struct SearchEngineExecutor {
    spec: QuerySpec,
    cache: Option<Arc<dyn CacheStore>>,
    client: Client,
    /// Cluster root, credentials stripped, always ending in `/`
    base_url: Url,
    index: String,
    username: Option<String>,
    password: Option<Sensitive<String>>,
    initialized: OnceCell<()>,
}

impl SearchEngineExecutor {
    pub fn new(spec: QuerySpec, cache: Option<Arc<dyn CacheStore>>) -> EngineResult<Self> {
        let source = &spec.datasource;
        let conn = &source.connection;

        let raw_url = conn.url.as_deref().ok_or_else(|| {
            EngineError::configuration(format!(
                "Datasource '{}' needs connection.url",
                source.id
            ))
        })?;
        let index = conn
            .index
            .clone()
            .filter(|i| !i.trim().is_empty())
            .ok_or_else(|| {
                EngineError::configuration(format!(
                    "Datasource '{}' needs connection.index",
                    source.id
                ))
            })?;

        let mut base_url = Url::parse(raw_url).map_err(|e| {
            EngineError::configuration(format!("Datasource '{}' has an invalid url: {e}", source.id))
        })?;

        // Credentials embedded in the URL take part only when the config has none.
        let url_user = Some(base_url.username().to_string()).filter(|u| !u.is_empty());
        let url_password = base_url.password().map(str::to_string);
        let username = conn.username.clone().or(url_user);
        let password = conn
            .password
            .clone()
            .or_else(|| url_password.map(Sensitive::new));

        let _ = base_url.set_username("");
        let _ = base_url.set_password(None);
        base_url.set_query(None);
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            spec,
            cache,
            client: Client::new(),
            base_url,
            index,
            username,
            password,
            initialized: OnceCell::new(),
        })
    }

    fn search_url(&self) -> EngineResult<Url> {
        let index = utf8_percent_encode(&self.index, INDEX_NAME).to_string();
        self.base_url
            .join(&format!("{index}/_search"))
            .map_err(|e| EngineError::internal(format!("Failed to build search URL: {e}")))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_ref().map(|p| p.expose())),
            None => request,
        }
    }

    /// Maps a non-success HTTP status to the matching engine error.
    fn status_error(&self, status: StatusCode, body: &str) -> EngineError {
        let source_id = &self.spec.datasource.id;
        let reason = extract_search_error(body).unwrap_or_else(|| format!("HTTP {status}: {body}"));
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                EngineError::auth_failed(source_id, reason)
            }
            StatusCode::BAD_REQUEST => EngineError::syntax_error(source_id, reason),
            _ => EngineError::execution_error(source_id, reason),
        }
    }
}

#[async_trait]
impl QueryExecutor for SearchEngineExecutor {
    fn backend_id(&self) -> &'static str {
        "search"
    }

    fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    fn cache(&self) -> Option<&Arc<dyn CacheStore>> {
        self.cache.as_ref()
    }

    /// Cluster, user and index. The password never takes part.
    fn connection_identity(&self) -> String {
        let mut target = self.base_url.clone();
        if let Some(user) = &self.username {
            let _ = target.set_username(user);
        }
        format!("{target}{}", self.index)
    }

    async fn initialize(&self) -> EngineResult<()> {
        self.initialized
            .get_or_try_init(|| async {
                let source_id = &self.spec.datasource.id;
                let response = self
                    .authorize(self.client.get(self.base_url.clone()))
                    .send()
                    .await
                    .map_err(|e| EngineError::connection_failed(source_id, e.to_string()))?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(match self.status_error(status, &body) {
                        auth @ EngineError::AuthenticationFailed { .. } => auth,
                        other => EngineError::connection_failed(source_id, other.to_string()),
                    });
                }

                info!(source = %source_id, target = %self.connection_identity(), "Search cluster reachable");
                Ok::<(), EngineError>(())
            })
            .await
            .map(|_| ())
    }

    async fn execute_raw(&self, query: &str, variable_binding: &str) -> EngineResult<RawResponse> {
        let source = &self.spec.datasource;
        let body = prepare_search_body(&source.id, query, variable_binding, source.max_results)?;

        debug!(source = %source.id, index = %self.index, "Search request");

        let response = self
            .authorize(self.client.post(self.search_url()?))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::connection_failed(&source.id, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.status_error(status, &text));
        }

        let document = response.json::<JsonValue>().await.map_err(|e| {
            EngineError::execution_error(&source.id, format!("Invalid search response: {e}"))
        })?;

        Ok(RawResponse::Document(document))
    }
}

/// Parses a populated request body and applies projection and size defaults.
///
/// `_source` is set to the variable binding when the body does not choose its
/// own fields. `size` falls back to the datasource row cap.
pub fn prepare_search_body(
    source_id: &str,
    query: &str,
    variable_binding: &str,
    max_results: Option<usize>,
) -> EngineResult<JsonValue> {
    let mut body: JsonValue = if query.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(query).map_err(|e| {
            EngineError::syntax_error(source_id, format!("Query is not valid JSON: {e}"))
        })?
    };

    let obj = body.as_object_mut().ok_or_else(|| {
        EngineError::validation(format!(
            "Search queries on '{source_id}' must be JSON objects"
        ))
    })?;

    if !variable_binding.is_empty()
        && variable_binding != DOCUMENT_ID_FIELD
        && !obj.contains_key("_source")
    {
        obj.insert("_source".to_string(), json!([variable_binding]));
    }

    if let Some(max) = max_results {
        obj.entry("size").or_insert_with(|| json!(max));
    }

    Ok(body)
}

/// Pulls `error.reason` out of a search error response.
fn extract_search_error(body: &str) -> Option<String> {
    let parsed: JsonValue = serde_json::from_str(body).ok()?;
    parsed
        .pointer("/error/reason")
        .or_else(|| parsed.pointer("/error/root_cause/0/reason"))
        .and_then(|r| r.as_str())
        .map(str::to_string)
}
