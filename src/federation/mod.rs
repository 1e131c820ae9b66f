// SPDX-License-Identifier: BUSL-1.1

//! Join Federation Engine
//!
//! Resolves join relations across satellite datasources and rewrites search
//! bodies so their results are restricted to the joined values.

pub mod injector;
pub mod manager;
pub mod planner;
pub mod types;

pub use manager::JoinEngine;
pub use planner::JoinPlanner;
