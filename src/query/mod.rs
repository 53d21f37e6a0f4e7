//! Query execution.
//!
//! This module isolates running an accepted statement on a pooled
//! connection from the validation and orchestration around it.

pub mod executor;

pub use executor::{ExecutionFailure, QueryExecutor};
