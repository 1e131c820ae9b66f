// SPDX-License-Identifier: Apache-2.0

//! Backend executors
//!
//! One `QueryExecutor` implementation per datasource type.

pub mod jdbc;
pub mod mysql;
pub mod search;
pub mod sql;

pub use jdbc::JdbcExecutor;
pub use mysql::MySqlExecutor;
pub use search::SearchEngineExecutor;
