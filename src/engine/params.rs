// SPDX-License-Identifier: Apache-2.0

//! Template parameter population
//!
//! Satellite queries are templates with `@name@` placeholders. A placeholder
//! resolves, in order, to the caller identity (`@username@`), a request
//! variable, or a datasource default, and is rendered in the quoting rules of
//! the backend's query language.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::OnceLock;

use base64::{engine::general_purpose::STANDARD, Engine};
use regex::{Captures, Regex};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{ExecutionContext, Value};

/// Placeholder bound to the caller identity.
pub const USERNAME_PARAMETER: &str = "username";

/// Fills a query template from the request context.
pub trait PopulateParameters: Send + Sync + Debug {
    fn populate(&self, template: &str, ctx: &ExecutionContext) -> EngineResult<String>;
}

/// Quoting rules for rendered values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterDialect {
    /// Standard SQL literals: quoted strings, `NULL`, comma lists for
    /// `IN (...)`. Only quotes are escaped.
    Sql,
    /// SQL literals for MySQL and MariaDB, where backslash is an escape
    /// character inside strings
    MySql,
    /// JSON literals for search request bodies
    Json,
}

/// `@name@` placeholder substitution with per-datasource defaults
#[derive(Debug, Clone)]
pub struct TemplateParameters {
    dialect: ParameterDialect,
    defaults: HashMap<String, Value>,
}

impl TemplateParameters {
    pub fn new(dialect: ParameterDialect) -> Self {
        Self {
            dialect,
            defaults: HashMap::new(),
        }
    }

    pub fn with_defaults(mut self, defaults: HashMap<String, Value>) -> Self {
        self.defaults = defaults;
        self
    }

    fn resolve(&self, name: &str, ctx: &ExecutionContext) -> Option<Value> {
        if name == USERNAME_PARAMETER {
            if let Some(identity) = ctx.identity.as_deref() {
                return Some(Value::Text(identity.to_string()));
            }
        }
        ctx.variable(name)
            .or_else(|| self.defaults.get(name))
            .cloned()
    }

    fn render(&self, value: &Value) -> String {
        match self.dialect {
            ParameterDialect::Sql => render_sql(value, false),
            ParameterDialect::MySql => render_sql(value, true),
            ParameterDialect::Json => value.to_json().to_string(),
        }
    }
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"@([A-Za-z_][A-Za-z0-9_.]*)@").expect("placeholder pattern is valid")
    })
}

impl PopulateParameters for TemplateParameters {
    fn populate(&self, template: &str, ctx: &ExecutionContext) -> EngineResult<String> {
        let mut missing: Vec<String> = Vec::new();

        let populated = placeholder_regex().replace_all(template, |caps: &Captures<'_>| {
            let name = &caps[1];
            match self.resolve(name, ctx) {
                Some(value) => self.render(&value),
                None => {
                    missing.push(name.to_string());
                    caps[0].to_string()
                }
            }
        });

        if !missing.is_empty() {
            return Err(EngineError::validation(format!(
                "Unresolved query parameters: {}",
                missing.join(", ")
            )));
        }

        Ok(populated.into_owned())
    }
}

/// Renders a value as a SQL literal.
///
/// Arrays render as a comma list for `IN (...)`; an empty array renders as
/// `NULL` so `IN (NULL)` matches nothing.
fn render_sql(value: &Value, escape_backslash: bool) -> String {
    let quote = |s: &str| quote_sql(s, escape_backslash);
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => f.to_string(),
        Value::Float(_) => "NULL".to_string(),
        Value::Text(s) => quote(s),
        Value::Bytes(b) => quote(&STANDARD.encode(b)),
        Value::Array(items) if items.is_empty() => "NULL".to_string(),
        Value::Array(items) => items
            .iter()
            .map(|item| render_sql(item, escape_backslash))
            .collect::<Vec<_>>()
            .join(", "),
        Value::Json(j) => quote(&j.to_string()),
    }
}

fn quote_sql(s: &str, escape_backslash: bool) -> String {
    let quoted = s.replace('\'', "''");
    if escape_backslash {
        format!("'{}'", quoted.replace('\\', "\\\\"))
    } else {
        format!("'{quoted}'")
    }
}
