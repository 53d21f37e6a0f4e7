//! Statement execution under a deadline.
//!
//! Runs an accepted statement on a pooled connection, racing the driver
//! against the statement timeout and the caller's cancellation token. The
//! same deadline and token travel to the driver, which interrupts the
//! statement on its side. Connections that may still be busy or broken are
//! marked unhealthy so the pool discards them instead of reusing them.

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::{DriverError, ExecutionResult, StatementBudget};
use crate::error::{ClassifiedError, ErrorKind};
use crate::pool::PooledConnection;
use crate::safety::RewrittenStatement;

/// Why an accepted statement produced no result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionFailure {
    #[error("statement exceeded its timeout")]
    Timeout,

    #[error("statement was cancelled by the caller")]
    Cancelled,

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl From<ExecutionFailure> for ClassifiedError {
    fn from(failure: ExecutionFailure) -> Self {
        match failure {
            ExecutionFailure::Timeout | ExecutionFailure::Cancelled => {
                ClassifiedError::new(ErrorKind::Timeout)
            }
            ExecutionFailure::Driver(_) => ClassifiedError::new(ErrorKind::ExecutionFailed),
        }
    }
}

/// Executes rewritten statements with a fixed per-statement timeout.
#[derive(Debug, Clone, Copy)]
pub struct QueryExecutor {
    statement_timeout: Duration,
}

impl QueryExecutor {
    /// Creates a new query executor.
    pub fn new(statement_timeout: Duration) -> Self {
        Self { statement_timeout }
    }

    pub fn statement_timeout(&self) -> Duration {
        self.statement_timeout
    }

    /// Runs `stmt` on `conn`, returning at most `stmt.applied_limit()` rows.
    pub async fn run(
        &self,
        conn: &mut PooledConnection,
        stmt: &RewrittenStatement,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        let max_rows = usize::try_from(stmt.applied_limit()).unwrap_or(usize::MAX);
        let start = Instant::now();
        let budget = StatementBudget::new(self.statement_timeout, cancel.clone());

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecutionFailure::Cancelled),
            fetched = timeout(self.statement_timeout, conn.fetch(stmt.sql(), max_rows, &budget)) => match fetched {
                Ok(Ok(set)) => Ok(set),
                Ok(Err(DriverError::Interrupted)) if budget.is_cancelled() => Err(ExecutionFailure::Cancelled),
                Ok(Err(DriverError::Interrupted)) => Err(ExecutionFailure::Timeout),
                Ok(Err(e)) => Err(ExecutionFailure::Driver(e)),
                Err(_) => Err(ExecutionFailure::Timeout),
            },
        };
        let elapsed = start.elapsed();

        match outcome {
            Ok(mut set) => {
                if set.rows.len() > max_rows {
                    warn!(
                        "Driver returned {} rows, truncating to {} rows",
                        set.rows.len(),
                        max_rows
                    );
                    set.rows.truncate(max_rows);
                }
                debug!(rows = set.rows.len(), ?elapsed, "Statement completed");
                Ok(ExecutionResult::new(set.columns, set.rows).with_execution_time(elapsed))
            }
            Err(failure) => {
                let poisoned = match &failure {
                    ExecutionFailure::Timeout | ExecutionFailure::Cancelled => true,
                    ExecutionFailure::Driver(e) => e.is_connection_level(),
                };
                if poisoned {
                    conn.mark_unhealthy();
                }
                Err(failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::db::MockConnector;
    use crate::pool::ConnectionPool;
    use crate::safety::{validate_sql, ValidationVerdict};
    use std::sync::Arc;

    fn accepted(sql: &str) -> RewrittenStatement {
        match validate_sql(sql) {
            ValidationVerdict::Accepted(stmt) => stmt,
            ValidationVerdict::Rejected(reason) => panic!("rejected '{}': {}", sql, reason),
        }
    }

    fn pool(connector: &MockConnector) -> ConnectionPool {
        ConnectionPool::new(Arc::new(connector.clone()), &PoolConfig::default())
    }

    #[tokio::test]
    async fn test_runs_rewritten_sql() {
        let connector = MockConnector::new();
        let pool = pool(&connector);
        let mut conn = pool.acquire().await.unwrap();

        let executor = QueryExecutor::new(Duration::from_secs(1));
        let result = executor
            .run(&mut conn, &accepted("select * from orders"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.row_count(), 3);
        assert_eq!(connector.executed(), vec!["select * from orders LIMIT 100"]);
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn test_rows_capped_at_applied_limit() {
        let connector = MockConnector::new().with_rows(1_000);
        let pool = pool(&connector);
        let mut conn = pool.acquire().await.unwrap();

        let executor = QueryExecutor::new(Duration::from_secs(1));
        let result = executor
            .run(
                &mut conn,
                &accepted("SELECT * FROM orders LIMIT 5000"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.row_count(), 200);
    }

    #[tokio::test]
    async fn test_timeout_marks_connection_unhealthy() {
        let connector = MockConnector::new().with_latency(Duration::from_millis(200));
        let pool = pool(&connector);
        let mut conn = pool.acquire().await.unwrap();

        let executor = QueryExecutor::new(Duration::from_millis(20));
        let err = executor
            .run(&mut conn, &accepted("SELECT 1"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, ExecutionFailure::Timeout);
        assert!(!conn.is_healthy());
        assert_eq!(ClassifiedError::from(err).kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let connector = MockConnector::new().with_latency(Duration::from_secs(5));
        let pool = pool(&connector);
        let mut conn = pool.acquire().await.unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let executor = QueryExecutor::new(Duration::from_secs(10));
        let err = executor
            .run(&mut conn, &accepted("SELECT 1"), &token)
            .await
            .unwrap_err();

        assert_eq!(err, ExecutionFailure::Cancelled);
        assert!(!conn.is_healthy());
    }

    #[tokio::test]
    async fn test_statement_error_keeps_connection() {
        let connector = MockConnector::new().with_statement_error_on("missing");
        let pool = pool(&connector);
        let mut conn = pool.acquire().await.unwrap();

        let executor = QueryExecutor::new(Duration::from_secs(1));
        let err = executor
            .run(
                &mut conn,
                &accepted("SELECT * FROM missing"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionFailure::Driver(DriverError::Statement(_))));
        assert!(conn.is_healthy());
        assert_eq!(ClassifiedError::from(err).kind(), ErrorKind::ExecutionFailed);
    }

    #[tokio::test]
    async fn test_driver_interrupt_reported_as_timeout() {
        // Zero timeout: the driver sees an exhausted budget as soon as it
        // runs, which may beat the outer timer.
        let connector = MockConnector::new();
        let pool = pool(&connector);
        let mut conn = pool.acquire().await.unwrap();

        let executor = QueryExecutor::new(Duration::ZERO);
        let err = executor
            .run(&mut conn, &accepted("SELECT 1"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, ExecutionFailure::Timeout);
        assert!(!conn.is_healthy());
    }

    #[tokio::test]
    async fn test_connection_error_marks_unhealthy() {
        let connector = MockConnector::new().with_connection_error_on("boom");
        let pool = pool(&connector);
        let mut conn = pool.acquire().await.unwrap();

        let executor = QueryExecutor::new(Duration::from_secs(1));
        let err = executor
            .run(&mut conn, &accepted("SELECT boom"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionFailure::Driver(DriverError::Connection(_))));
        assert!(!conn.is_healthy());
    }
}
