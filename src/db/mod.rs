//! Database abstraction layer.
//!
//! Provides a trait-based interface over a single driver connection, so the
//! pool and executor can run against SQLite or the in-memory mock
//! interchangeably.

pub mod mock;
mod sqlite;
mod types;

pub use mock::MockConnector;
pub use sqlite::SqliteConnector;
pub use types::{ExecutionResult, Row, Value};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Rows and column names fetched by a driver, before timing is attached.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// True if the driver stopped reading before the cursor was exhausted.
    pub truncated: bool,
}

/// Errors reported by a driver.
///
/// The text is kept for internal logs only and never reaches callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The statement failed but the connection is still usable.
    #[error("statement error: {0}")]
    Statement(String),

    /// The connection itself is broken and must be discarded.
    #[error("connection error: {0}")]
    Connection(String),

    /// The driver stopped the statement because its budget ran out.
    #[error("statement interrupted")]
    Interrupted,
}

impl DriverError {
    /// Returns true if the connection that produced this error is unusable.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Wall-clock deadline and cancellation signal for one statement.
///
/// Drivers check it while the statement runs on their side, so a busy
/// connection stops working once the caller has given up on it.
#[derive(Debug, Clone)]
pub struct StatementBudget {
    deadline: Instant,
    cancel: CancellationToken,
}

impl StatementBudget {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// A budget with no caller-side cancellation.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(timeout, CancellationToken::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once the deadline has passed or the caller cancelled.
    pub fn is_exhausted(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }
}

/// One live driver connection.
#[async_trait]
pub trait DatabaseConnection: Send {
    /// Cheap liveness probe (`SELECT 1`).
    async fn ping(&mut self) -> std::result::Result<(), DriverError>;

    /// Runs a read query and returns at most `max_rows` rows.
    ///
    /// Implementations stop the statement with [`DriverError::Interrupted`]
    /// once `budget` is exhausted.
    async fn fetch(
        &mut self,
        sql: &str,
        max_rows: usize,
        budget: &StatementBudget,
    ) -> std::result::Result<ResultSet, DriverError>;

    /// Closes the connection. Errors are swallowed; the handle is gone either way.
    async fn close(&mut self);
}

/// Opens new driver connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> std::result::Result<Box<dyn DatabaseConnection>, DriverError>;
}

/// Creates the connector for the configured database URL.
///
/// This is the central factory for driver connections.
pub fn connector_for(config: &DatabaseConfig) -> Result<Arc<dyn Connector>> {
    let connector = SqliteConnector::from_config(config)?;
    Ok(Arc::new(connector))
}
