//! Bounded connection pool.
//!
//! A semaphore caps the number of connections checked out at once; idle
//! connections are kept in a stack and probed before reuse. The invariant
//! is `live <= max` at every instant: a connection is counted as live from
//! the moment it is opened until it is discarded, and each live connection
//! is either idle or held by exactly one permit.
//!
//! Discarded connections stop counting as live immediately; closing them
//! happens on a background task so a busy driver never stalls the caller.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::db::{Connector, DatabaseConnection, DriverError, ResultSet, StatementBudget};
use crate::error::{ClassifiedError, ErrorKind};

/// Why a connection could not be handed out.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// No slot became free within the acquire timeout.
    #[error("timed out waiting for a free connection")]
    Exhausted,

    /// A slot was free but opening a connection failed.
    #[error("could not open a connection: {0}")]
    ConnectFailed(DriverError),

    /// The pool has been shut down.
    #[error("connection pool is closed")]
    Closed,
}

impl From<AcquireError> for ClassifiedError {
    fn from(_: AcquireError) -> Self {
        ClassifiedError::new(ErrorKind::PoolExhausted)
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Connections currently open, idle or in use.
    pub live: usize,
    pub idle: usize,
    /// Slots currently checked out.
    pub in_use: usize,
    pub max: usize,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn DatabaseConnection>>>,
    live: AtomicUsize,
    closed: AtomicBool,
    max: usize,
    acquire_timeout: Duration,
    probe_timeout: Duration,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, Vec<Box<dyn DatabaseConnection>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pop_idle(&self) -> Option<Box<dyn DatabaseConnection>> {
        self.idle().pop()
    }

    /// Forgets a connection and closes it in the background.
    fn discard(&self, mut conn: Box<dyn DatabaseConnection>) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { conn.close().await });
            }
            Err(_) => drop(conn),
        }
    }
}

/// A bounded pool of database connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionPool {
    /// Creates an empty pool. Connections are opened lazily.
    pub fn new(connector: Arc<dyn Connector>, config: &PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                semaphore: Arc::new(Semaphore::new(config.pool_size)),
                idle: Mutex::new(Vec::with_capacity(config.pool_size)),
                live: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                max: config.pool_size,
                acquire_timeout: config.acquire_timeout(),
                probe_timeout: config.probe_timeout(),
            }),
        }
    }

    /// Checks out a healthy connection, waiting at most the acquire timeout.
    ///
    /// Idle connections are probed first; failed probes are discarded and
    /// the next one is tried. Probes and the fresh connection opened when
    /// no idle connection survives all share the same deadline.
    pub async fn acquire(&self) -> Result<PooledConnection, AcquireError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(AcquireError::Closed);
        }

        let deadline = Instant::now() + inner.acquire_timeout;
        let waited = timeout(inner.acquire_timeout, inner.semaphore.clone().acquire_owned()).await;
        let mut permit = match waited {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(AcquireError::Closed),
            Err(_) => return Err(AcquireError::Exhausted),
        };

        if inner.closed.load(Ordering::SeqCst) {
            return Err(AcquireError::Closed);
        }

        while let Some(conn) = inner.pop_idle() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                inner.idle().push(conn);
                return Err(AcquireError::Exhausted);
            }

            let mut pooled = PooledConnection::new(conn, permit, self.inner.clone());
            let probe = timeout(inner.probe_timeout.min(remaining), pooled.ping()).await;
            match probe {
                Ok(Ok(())) => return Ok(pooled),
                Ok(Err(e)) => warn!("Discarding idle connection that failed its probe: {}", e),
                Err(_) => warn!("Discarding idle connection whose probe timed out"),
            }
            permit = match pooled.discard_keep_permit() {
                Some(permit) => permit,
                None => return Err(AcquireError::Closed),
            };
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AcquireError::Exhausted);
        }
        match timeout(remaining, inner.connector.connect()).await {
            Ok(Ok(conn)) => {
                inner.live.fetch_add(1, Ordering::SeqCst);
                debug!("Opened pooled connection ({} live)", inner.live.load(Ordering::SeqCst));
                Ok(PooledConnection::new(conn, permit, self.inner.clone()))
            }
            Ok(Err(e)) => {
                warn!("Failed to open database connection: {}", e);
                Err(AcquireError::ConnectFailed(e))
            }
            Err(_) => Err(AcquireError::Exhausted),
        }
    }

    /// Returns the current pool counters.
    pub fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        let idle = inner.idle().len();
        PoolStatus {
            live: inner.live.load(Ordering::SeqCst),
            idle,
            in_use: inner.max.saturating_sub(inner.semaphore.available_permits()),
            max: inner.max,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stops handing out connections and closes every idle one.
    ///
    /// Connections still checked out are closed when they are released.
    pub async fn close(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::SeqCst);
        inner.semaphore.close();

        let drained: Vec<_> = std::mem::take(&mut *inner.idle());
        debug!("Closing {} idle connections", drained.len());
        for mut conn in drained {
            inner.live.fetch_sub(1, Ordering::SeqCst);
            conn.close().await;
        }
    }
}

/// A connection checked out of the pool.
///
/// Call [`PooledConnection::release`] when done. Dropping it without
/// releasing discards the connection and frees its slot.
pub struct PooledConnection {
    conn: Option<Box<dyn DatabaseConnection>>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
    healthy: bool,
}

impl PooledConnection {
    fn new(
        conn: Box<dyn DatabaseConnection>,
        permit: OwnedSemaphorePermit,
        pool: Arc<PoolInner>,
    ) -> Self {
        Self {
            conn: Some(conn),
            permit: Some(permit),
            pool,
            healthy: true,
        }
    }

    fn released() -> DriverError {
        DriverError::Connection("connection already returned to the pool".to_string())
    }

    pub async fn ping(&mut self) -> Result<(), DriverError> {
        match self.conn.as_mut() {
            Some(conn) => conn.ping().await,
            None => Err(Self::released()),
        }
    }

    pub async fn fetch(
        &mut self,
        sql: &str,
        max_rows: usize,
        budget: &StatementBudget,
    ) -> Result<ResultSet, DriverError> {
        match self.conn.as_mut() {
            Some(conn) => conn.fetch(sql, max_rows, budget).await,
            None => Err(Self::released()),
        }
    }

    /// Prevents this connection from going back to the idle set.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Returns the connection to the pool after a liveness probe.
    ///
    /// Connections marked unhealthy, failing the probe, or released after
    /// the pool closed are discarded instead.
    pub async fn release(mut self) {
        if self.conn.is_none() {
            return;
        }

        if self.healthy && !self.pool.closed.load(Ordering::SeqCst) {
            let probe = timeout(self.pool.probe_timeout, self.ping()).await;
            match probe {
                Ok(Ok(())) => {
                    if !self.pool.closed.load(Ordering::SeqCst) {
                        // Back to idle while the permit is still held.
                        if let Some(conn) = self.conn.take() {
                            self.pool.idle().push(conn);
                        }
                        return;
                    }
                }
                Ok(Err(e)) => warn!("Discarding connection that failed its release probe: {}", e),
                Err(_) => warn!("Discarding connection whose release probe timed out"),
            }
        }

        debug!("Discarding connection on release");
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }

    /// Discards the connection but keeps its slot for another attempt.
    fn discard_keep_permit(mut self) -> Option<OwnedSemaphorePermit> {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
        self.permit.take()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.live.fetch_sub(1, Ordering::SeqCst);
            drop(conn);
        }
    }
}
