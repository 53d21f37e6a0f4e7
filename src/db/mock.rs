//! Mock database connector for testing.
//!
//! Provides an in-memory connection implementation for headless testing of
//! the pool, executor and engine. Every connector shares counters with the
//! connections it opens, so tests can observe what reached the "database".

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Connector, DatabaseConnection, DriverError, ResultSet, StatementBudget, Value};

#[derive(Debug, Default)]
struct MockState {
    open: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    pings: AtomicUsize,
    ping_delay_ms: AtomicU64,
    unhealthy: AtomicBool,
    fail_connect: AtomicBool,
    executed: Mutex<Vec<String>>,
}

/// A mock connector that hands out in-memory connections.
#[derive(Debug, Clone)]
pub struct MockConnector {
    state: Arc<MockState>,
    latency: Duration,
    rows_per_query: usize,
    statement_error_on: Option<String>,
    connection_error_on: Option<String>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Creates a connector whose queries return three rows immediately.
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
            latency: Duration::ZERO,
            rows_per_query: 3,
            statement_error_on: None,
            connection_error_on: None,
        }
    }

    /// Delays every fetch by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of rows the "database" produces before the row cap applies.
    pub fn with_rows(mut self, rows: usize) -> Self {
        self.rows_per_query = rows;
        self
    }

    /// Fails statements containing `pattern` with a statement-level error.
    pub fn with_statement_error_on(mut self, pattern: impl Into<String>) -> Self {
        self.statement_error_on = Some(pattern.into());
        self
    }

    /// Fails statements containing `pattern` with a connection-level error.
    pub fn with_connection_error_on(mut self, pattern: impl Into<String>) -> Self {
        self.connection_error_on = Some(pattern.into());
        self
    }

    /// Makes liveness probes fail (or succeed again).
    pub fn set_healthy(&self, healthy: bool) {
        self.state.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    /// Delays every liveness probe by `delay`.
    pub fn set_ping_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.state.ping_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Makes new connection attempts fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Connections ever opened.
    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Connections explicitly closed.
    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Highest number of fetches observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.state.peak_active.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    /// Every SQL text that reached a connection, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state
            .executed
            .lock()
            .map(|sqls| sqls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn DatabaseConnection>, DriverError> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(DriverError::Connection("mock connect refused".to_string()));
        }
        self.state.open.fetch_add(1, Ordering::SeqCst);
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            connector: self.clone(),
            closed: false,
        }))
    }
}

struct MockConnection {
    connector: MockConnector,
    closed: bool,
}

/// Decrements the in-flight counter even if the fetch future is dropped.
struct ActiveGuard<'a>(&'a MockState);

impl<'a> ActiveGuard<'a> {
    fn enter(state: &'a MockState) -> Self {
        let now = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_active.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DatabaseConnection for MockConnection {
    async fn ping(&mut self) -> Result<(), DriverError> {
        let state = &self.connector.state;
        state.pings.fetch_add(1, Ordering::SeqCst);
        let delay = state.ping_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.closed || state.unhealthy.load(Ordering::SeqCst) {
            return Err(DriverError::Connection("mock connection is down".to_string()));
        }
        Ok(())
    }

    async fn fetch(
        &mut self,
        sql: &str,
        max_rows: usize,
        budget: &StatementBudget,
    ) -> Result<ResultSet, DriverError> {
        let connector = &self.connector;
        if let Ok(mut executed) = connector.state.executed.lock() {
            executed.push(sql.to_string());
        }

        let _active = ActiveGuard::enter(&connector.state);
        if !connector.latency.is_zero() {
            tokio::time::sleep(connector.latency).await;
        }
        if budget.is_exhausted() {
            return Err(DriverError::Interrupted);
        }

        if connector
            .connection_error_on
            .as_deref()
            .is_some_and(|p| sql.contains(p))
        {
            return Err(DriverError::Connection("mock connection dropped".to_string()));
        }
        if connector
            .statement_error_on
            .as_deref()
            .is_some_and(|p| sql.contains(p))
        {
            return Err(DriverError::Statement(format!("mock failure running: {sql}")));
        }

        let produced = connector.rows_per_query;
        let rows = (0..produced.min(max_rows))
            .map(|i| vec![Value::Int(i as i64 + 1), Value::Text(format!("row {}", i + 1))])
            .collect();

        Ok(ResultSet {
            columns: vec!["id".to_string(), "value".to_string()],
            rows,
            truncated: produced > max_rows,
        })
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.connector.state.closed.fetch_add(1, Ordering::SeqCst);
            self.connector.state.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.connector.state.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
