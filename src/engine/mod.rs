// SPDX-License-Identifier: Apache-2.0

// Query engine module
// Backend-neutral execution of satellite queries with result caching

pub mod catalog;
pub mod error;
pub mod executors;
pub mod params;
pub mod registry;
pub mod traits;
pub mod types;

pub use catalog::QueryCatalog;
pub use error::{EngineError, EngineResult};
pub use params::{ParameterDialect, PopulateParameters, TemplateParameters};
pub use registry::{BackendDescriptor, BackendRegistry};
pub use traits::QueryExecutor;
pub use types::*;
