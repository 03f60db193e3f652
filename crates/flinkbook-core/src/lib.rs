//! Supervises a local Flink runtime and runs SQL statements through its SQL
//! Gateway, exposing results as snapshot streams.

pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod runtime;
pub mod session;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use context::{ClusterContext, ClusterContextBuilder};
pub use error::{Error, Result};
