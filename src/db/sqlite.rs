//! SQLite connection implementation.
//!
//! Provides the `SqliteConnector` struct that implements the `Connector`
//! trait using sqlx. Connections are opened read-only unless configured
//! otherwise, and never create the database file.

use async_trait::async_trait;
use base64::Engine as _;
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column as _, Connection, Executor, Row as _, Statement, TypeInfo, ValueRef};
use std::str::FromStr;
use tracing::{debug, warn};

use super::{Connector, DatabaseConnection, DriverError, ResultSet, Row, StatementBudget, Value};
use crate::config::DatabaseConfig;
use crate::error::{GuardError, Result};

/// Virtual machine instructions between two budget checks.
const PROGRESS_OPS: i32 = 1_000;

/// Primary result code of a statement stopped by the progress handler.
const SQLITE_INTERRUPT: i64 = 9;

/// SQLite primary result codes after which a connection is not reused.
const SQLITE_NOMEM: i64 = 7;
const SQLITE_IOERR: i64 = 10;
const SQLITE_CORRUPT: i64 = 11;
const SQLITE_CANTOPEN: i64 = 14;
const SQLITE_NOTADB: i64 = 26;

/// Opens SQLite connections with fixed options.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    options: SqliteConnectOptions,
}

impl SqliteConnector {
    /// Builds a connector from a `sqlite:` URL.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        if !config.url.starts_with("sqlite:") {
            return Err(GuardError::config(format!(
                "Unsupported database URL '{}'. Only sqlite: URLs are supported.",
                config.display_string()
            )));
        }

        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| GuardError::config(format!("Invalid database URL: {e}")))?
            .read_only(config.read_only)
            .create_if_missing(false);

        Ok(Self { options })
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(&self) -> std::result::Result<Box<dyn DatabaseConnection>, DriverError> {
        let conn = SqliteConnection::connect_with(&self.options)
            .await
            .map_err(|e| DriverError::Connection(e.to_string()))?;
        debug!("Opened SQLite connection");
        Ok(Box::new(SqliteHandle { conn: Some(conn) }))
    }
}

/// A single open SQLite connection.
struct SqliteHandle {
    conn: Option<SqliteConnection>,
}

impl SqliteHandle {
    fn conn(&mut self) -> std::result::Result<&mut SqliteConnection, DriverError> {
        self.conn
            .as_mut()
            .ok_or_else(|| DriverError::Connection("connection already closed".to_string()))
    }
}

#[async_trait]
impl DatabaseConnection for SqliteHandle {
    async fn ping(&mut self) -> std::result::Result<(), DriverError> {
        let conn = self.conn()?;
        sqlx::query("SELECT 1")
            .execute(&mut *conn)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn fetch(
        &mut self,
        sql: &str,
        max_rows: usize,
        budget: &StatementBudget,
    ) -> std::result::Result<ResultSet, DriverError> {
        let conn = self.conn()?;
        {
            // The handler runs on the worker thread between VM steps, so it
            // stops the statement even after this future has been dropped.
            let budget = budget.clone();
            let mut handle = conn.lock_handle().await.map_err(classify_sqlx_error)?;
            handle.set_progress_handler(PROGRESS_OPS, move || !budget.is_exhausted());
        }

        let fetched = fetch_rows(conn, sql, max_rows).await;

        match conn.lock_handle().await {
            Ok(mut handle) => handle.remove_progress_handler(),
            Err(e) => debug!("Could not clear progress handler: {}", e),
        }
        fetched
    }

    async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                debug!("Error while closing SQLite connection: {}", e);
            }
        }
    }
}

/// Streams up to `max_rows` rows of `sql`.
async fn fetch_rows(
    conn: &mut SqliteConnection,
    sql: &str,
    max_rows: usize,
) -> std::result::Result<ResultSet, DriverError> {
    let mut rows: Vec<Row> = Vec::new();
    let mut columns: Vec<String> = Vec::new();
    let mut truncated = false;
    {
        let mut stream = sqlx::query(sql).persistent(false).fetch(&mut *conn);
        while let Some(row) = stream.try_next().await.map_err(classify_sqlx_error)? {
            if rows.len() >= max_rows {
                truncated = true;
                break;
            }
            if columns.is_empty() {
                columns = row.columns().iter().map(|c| c.name().to_string()).collect();
            }
            rows.push(convert_row(&row));
        }
    }

    if truncated {
        warn!("Driver returned more than {} rows, truncating", max_rows);
    }

    // Empty result: take column names from the prepared statement instead.
    if rows.is_empty() {
        columns = match (&mut *conn).prepare(sql).await {
            Ok(stmt) => stmt.columns().iter().map(|c| c.name().to_string()).collect(),
            Err(e) => {
                debug!("Could not describe empty result: {}", e);
                Vec::new()
            }
        };
    }

    Ok(ResultSet {
        columns,
        rows,
        truncated,
    })
}

/// Converts a sqlx SqliteRow to our Row type.
fn convert_row(row: &SqliteRow) -> Row {
    (0..row.columns().len())
        .map(|i| convert_value(row, i))
        .collect()
}

/// Converts a single column value using the storage class of the value itself.
///
/// SQLite has no boolean storage class: `TRUE`, `FALSE` and comparisons come
/// back as `Value::Int`.
fn convert_value(row: &SqliteRow, index: usize) -> Value {
    let type_name = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_uppercase(),
        Err(_) => return Value::Null,
    };

    match type_name.as_str() {
        "INTEGER" | "INT" | "BIGINT" => row
            .try_get_unchecked::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "REAL" | "FLOAT" | "DOUBLE" => row
            .try_get_unchecked::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "BLOB" => row
            .try_get_unchecked::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(|bytes| Value::Text(base64::engine::general_purpose::STANDARD.encode(bytes)))
            .unwrap_or(Value::Null),

        // TEXT, NUMERIC, DATETIME and friends come back as text.
        _ => row
            .try_get_unchecked::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::Text)
            .unwrap_or(Value::Null),
    }
}

/// Splits sqlx errors into statement-level and connection-level failures.
fn classify_sqlx_error(error: sqlx::Error) -> DriverError {
    match &error {
        sqlx::Error::Database(db_error) => {
            let primary = db_error
                .code()
                .and_then(|code| code.parse::<i64>().ok())
                .map(|code| code & 0xff);
            match primary {
                Some(SQLITE_INTERRUPT) => DriverError::Interrupted,
                Some(
                    SQLITE_NOMEM | SQLITE_IOERR | SQLITE_CORRUPT | SQLITE_CANTOPEN | SQLITE_NOTADB,
                ) => DriverError::Connection(error.to_string()),
                _ => DriverError::Statement(error.to_string()),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::PoolClosed
        | sqlx::Error::PoolTimedOut => DriverError::Connection(error.to_string()),
        _ => DriverError::Statement(error.to_string()),
    }
}
