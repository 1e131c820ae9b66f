// SPDX-License-Identifier: Apache-2.0

//! Storage encoding for cached results.
//!
//! `Value` serializes untagged so results read naturally as JSON, which loses
//! the variant on the way back (`Bytes` reads as `Text`, `Json([..])` as
//! `Array`). Stores that keep results as text use this tagged form instead.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{Binding, ResultSet, Value};

#[derive(Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
enum StoredValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(String),
    Array(Vec<StoredValue>),
    Json(serde_json::Value),
}

#[derive(Serialize, Deserialize)]
struct StoredResult {
    bindings: Vec<BTreeMap<String, StoredValue>>,
}

impl From<&Value> for StoredValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => StoredValue::Null,
            Value::Bool(b) => StoredValue::Bool(*b),
            Value::Int(i) => StoredValue::Int(*i),
            Value::Float(f) => StoredValue::Float(*f),
            Value::Text(s) => StoredValue::Text(s.clone()),
            Value::Bytes(b) => StoredValue::Bytes(STANDARD.encode(b)),
            Value::Array(items) => StoredValue::Array(items.iter().map(StoredValue::from).collect()),
            Value::Json(j) => StoredValue::Json(j.clone()),
        }
    }
}

impl TryFrom<StoredValue> for Value {
    type Error = EngineError;

    fn try_from(stored: StoredValue) -> EngineResult<Self> {
        Ok(match stored {
            StoredValue::Null => Value::Null,
            StoredValue::Bool(b) => Value::Bool(b),
            StoredValue::Int(i) => Value::Int(i),
            StoredValue::Float(f) => Value::Float(f),
            StoredValue::Text(s) => Value::Text(s),
            StoredValue::Bytes(b) => Value::Bytes(
                STANDARD
                    .decode(b)
                    .map_err(|e| EngineError::cache(format!("Corrupt cached bytes: {e}")))?,
            ),
            StoredValue::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<EngineResult<_>>()?,
            ),
            StoredValue::Json(j) => Value::Json(j),
        })
    }
}

pub fn encode(results: &ResultSet) -> EngineResult<String> {
    let stored = StoredResult {
        bindings: results
            .bindings
            .iter()
            .map(|row| {
                row.iter()
                    .map(|(column, value)| (column.clone(), StoredValue::from(value)))
                    .collect()
            })
            .collect(),
    };
    serde_json::to_string(&stored)
        .map_err(|e| EngineError::cache(format!("Failed to encode result: {e}")))
}

pub fn decode(payload: &str) -> EngineResult<ResultSet> {
    let stored: StoredResult = serde_json::from_str(payload)
        .map_err(|e| EngineError::cache(format!("Corrupt cache entry: {e}")))?;

    let bindings = stored
        .bindings
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|(column, value)| Ok((column, Value::try_from(value)?)))
                .collect::<EngineResult<Binding>>()
        })
        .collect::<EngineResult<Vec<_>>>()?;

    Ok(ResultSet::new(bindings))
}
