//! The guarded query engine.
//!
//! Wires the guardrail, the connection pool and the executor into the single
//! entry point callers use. Validation failures return before any connection
//! is touched; every checked-out connection is released on every path.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::db::{self, Connector, ExecutionResult};
use crate::error::{ClassifiedError, ErrorKind, Result};
use crate::pool::{ConnectionPool, PoolStatus};
use crate::query::{ExecutionFailure, QueryExecutor};
use crate::safety::{Guardrail, GuardrailPolicy, ValidationVerdict};

/// Longest statement prefix written to the query log.
const LOGGED_SQL_CHARS: usize = 100;

/// Per-request information supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    request_id: Option<String>,
    cancel: CancellationToken,
}

impl CallerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags log output for this request.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Lets the caller abort the request while it waits or runs.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Validates, bounds and executes read-only SQL.
#[derive(Debug)]
pub struct GuardedEngine {
    guardrail: Guardrail,
    pool: ConnectionPool,
    executor: QueryExecutor,
    log_queries: bool,
}

impl GuardedEngine {
    /// Builds an engine for the configured database.
    ///
    /// Connections are opened lazily, so a missing database surfaces on the
    /// first query (or [`GuardedEngine::health_check`]), not here.
    pub fn start(config: &Config) -> Result<Self> {
        let connector = db::connector_for(&config.database)?;
        Self::with_connector(config, connector)
    }

    /// Builds an engine over an arbitrary connector.
    pub fn with_connector(config: &Config, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;

        let policy = Arc::new(GuardrailPolicy::from_config(&config.guardrails));
        info!(
            database = %config.database.display_string(),
            pool_size = config.pool.pool_size,
            default_limit = config.guardrails.default_row_limit,
            max_limit = config.guardrails.max_row_limit,
            "Guarded query engine ready"
        );

        Ok(Self {
            guardrail: Guardrail::new(policy),
            pool: ConnectionPool::new(connector, &config.pool),
            executor: QueryExecutor::new(config.pool.statement_timeout()),
            log_queries: config.logging.log_queries,
        })
    }

    /// Dry-runs validation without touching the database.
    pub fn validate(&self, raw_sql: &str) -> ValidationVerdict {
        self.guardrail.validate(raw_sql)
    }

    /// Validates `raw_sql`, enforces its row limit and runs it.
    ///
    /// Errors carry only the fixed caller-safe message for their kind; the
    /// underlying detail is logged.
    pub async fn execute_guarded_query(
        &self,
        raw_sql: &str,
        ctx: &CallerContext,
    ) -> std::result::Result<ExecutionResult, ClassifiedError> {
        let span = info_span!("guarded_query", request_id = ctx.request_id().unwrap_or("-"));
        self.run_guarded(raw_sql, ctx).instrument(span).await
    }

    async fn run_guarded(
        &self,
        raw_sql: &str,
        ctx: &CallerContext,
    ) -> std::result::Result<ExecutionResult, ClassifiedError> {
        let stmt = match self.guardrail.validate(raw_sql) {
            ValidationVerdict::Accepted(stmt) => stmt,
            ValidationVerdict::Rejected(reason) => {
                warn!(%reason, "Rejected statement");
                return Err(reason.into());
            }
        };

        if self.log_queries {
            info!(
                sql = %truncate_for_log(stmt.sql()),
                limit = stmt.applied_limit(),
                action = ?stmt.limit_action(),
                "Executing statement"
            );
        }

        let cancel = ctx.cancellation();
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Request cancelled while waiting for a connection");
                return Err(ClassifiedError::new(ErrorKind::Timeout));
            }
            acquired = self.pool.acquire() => acquired,
        };
        let mut conn = acquired.map_err(|e| {
            warn!(error = %e, "Could not acquire a connection");
            ClassifiedError::from(e)
        })?;

        let outcome = self.executor.run(&mut conn, &stmt, cancel).await;

        // Release runs on every outcome before anything is returned.
        conn.release().await;

        match outcome {
            Ok(result) => {
                debug!(
                    rows = result.row_count(),
                    elapsed_ms = result.execution_time().as_millis() as u64,
                    "Statement succeeded"
                );
                Ok(result)
            }
            Err(failure) => {
                match &failure {
                    ExecutionFailure::Driver(e) => error!(error = %e, "Statement failed"),
                    other => warn!(error = %other, "Statement did not complete"),
                }
                Err(failure.into())
            }
        }
    }

    /// Checks out a connection and probes it.
    pub async fn health_check(&self) -> bool {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Health check could not acquire a connection");
                return false;
            }
        };

        let healthy = match conn.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Health check probe failed");
                conn.mark_unhealthy();
                false
            }
        };
        conn.release().await;
        healthy
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Closes the pool. Later queries fail with `PoolExhausted`.
    pub async fn shutdown(&self) {
        info!("Shutting down guarded query engine");
        self.pool.close().await;
    }
}

/// Shortens a statement for the query log on a character boundary.
fn truncate_for_log(sql: &str) -> String {
    match sql.char_indices().nth(LOGGED_SQL_CHARS) {
        Some((end, _)) => format!("{}...", &sql[..end]),
        None => sql.to_string(),
    }
}
