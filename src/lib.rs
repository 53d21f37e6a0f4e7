//! sql-guardrail - guarded execution of read-only SQL.
//!
//! This library exposes the engine and its building blocks for the
//! `sqlguard` binary and for integration tests.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod pool;
pub mod query;
pub mod safety;

pub use engine::{CallerContext, GuardedEngine};
pub use error::{ClassifiedError, ErrorKind};
