// SPDX-License-Identifier: BUSL-1.1

//! Filter injection into search request bodies.
//!
//! Injected clauses are tagged with the search engine's `_name` field, so a
//! clause for the same relation and field replaces the previous one instead
//! of piling up.

use serde_json::{json, Map, Value as JsonValue};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::Value;

/// Named-query marker for a relation/field pair.
pub fn filter_marker(relation: &str, field: &str) -> String {
    format!("joinery:{relation}:{field}")
}

/// Restricts `field` in `body` to `values`.
///
/// An empty value set injects a clause that matches no document, so an empty
/// join never widens the search.
pub fn inject_filter(
    body: &mut JsonValue,
    relation: &str,
    field: &str,
    values: &[Value],
) -> EngineResult<()> {
    let marker = filter_marker(relation, field);
    let clause = build_clause(field, values, &marker);

    let filters = bool_filters(body)?;
    filters.retain(|c| !has_marker(c, &marker));
    filters.push(clause);
    Ok(())
}

/// Removes a clause previously injected for `relation`/`field`.
///
/// Returns whether a clause was removed.
pub fn remove_filter(body: &mut JsonValue, relation: &str, field: &str) -> EngineResult<bool> {
    let obj = body
        .as_object_mut()
        .ok_or_else(|| EngineError::validation("Search body must be a JSON object"))?;

    let marker = filter_marker(relation, field);
    let Some(filter) = obj
        .get_mut("query")
        .and_then(|q| q.get_mut("bool"))
        .and_then(|b| b.get_mut("filter"))
    else {
        return Ok(false);
    };

    match filter {
        JsonValue::Array(clauses) => {
            let before = clauses.len();
            clauses.retain(|c| !has_marker(c, &marker));
            Ok(clauses.len() != before)
        }
        single if has_marker(single, &marker) => {
            *single = json!([]);
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn build_clause(field: &str, values: &[Value], marker: &str) -> JsonValue {
    if values.is_empty() {
        return json!({
            "bool": {
                "must_not": [{"match_all": {}}],
                "_name": marker
            }
        });
    }

    let mut terms = Map::new();
    terms.insert(
        field.to_string(),
        JsonValue::Array(values.iter().map(Value::to_json).collect()),
    );
    terms.insert("_name".to_string(), JsonValue::String(marker.to_string()));
    json!({ "terms": terms })
}

fn has_marker(clause: &JsonValue, marker: &str) -> bool {
    clause.as_object().is_some_and(|outer| {
        outer
            .values()
            .any(|inner| inner.get("_name").and_then(JsonValue::as_str) == Some(marker))
    })
}

/// Normalizes `body.query` into a `bool` query and returns its filter list.
fn bool_filters(body: &mut JsonValue) -> EngineResult<&mut Vec<JsonValue>> {
    let obj = body
        .as_object_mut()
        .ok_or_else(|| EngineError::validation("Search body must be a JSON object"))?;

    let query = obj.entry("query").or_insert(JsonValue::Null);
    if !is_bool_query(query) {
        let original = query.take();
        *query = match original {
            JsonValue::Null => json!({"bool": {}}),
            JsonValue::Object(ref o) if o.is_empty() => json!({"bool": {}}),
            other => json!({"bool": {"must": [other]}}),
        };
    }

    let bool_obj = query
        .get_mut("bool")
        .and_then(JsonValue::as_object_mut)
        .ok_or_else(|| EngineError::internal("bool query lost during normalization"))?;

    let filter = bool_obj.entry("filter").or_insert_with(|| json!([]));
    if filter.is_object() {
        let single = filter.take();
        *filter = json!([single]);
    }

    filter
        .as_array_mut()
        .ok_or_else(|| EngineError::validation("query.bool.filter must be an object or array"))
}

/// Whether `query` is a bool query that takes an extra filter without
/// matching more documents.
///
/// A bool query whose only scoring clauses are `should` needs one of them to
/// match; once a `filter` is present that requirement drops to zero, so such
/// queries are wrapped instead.
fn is_bool_query(query: &JsonValue) -> bool {
    let Some(bool_obj) = query
        .as_object()
        .filter(|o| o.len() == 1)
        .and_then(|o| o.get("bool"))
        .and_then(JsonValue::as_object)
    else {
        return false;
    };

    !bool_obj.contains_key("should")
        || ["must", "filter", "minimum_should_match"]
            .iter()
            .any(|key| bool_obj.contains_key(*key))
}
