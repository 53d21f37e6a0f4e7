//! Integration tests for sql-guardrail.
//!
//! Each test seeds its own SQLite file and drives the public engine API.

pub mod engine_test;
pub mod pool_test;

use sql_guardrail::config::Config;
use sql_guardrail::engine::GuardedEngine;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::Connection;
use std::path::PathBuf;
use std::str::FromStr;
use tempfile::TempDir;

/// Number of rows seeded into `orders`.
pub const ORDER_ROWS: i64 = 500;

/// A seeded database that lives as long as this value.
pub struct TestDatabase {
    _dir: TempDir,
    pub path: PathBuf,
    pub url: String,
}

impl TestDatabase {
    /// Engine configuration pointing at this database.
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.database.url = self.url.clone();
        config
    }

    pub fn engine(&self) -> GuardedEngine {
        GuardedEngine::start(&self.config()).expect("engine should start")
    }

    /// Opens a writable side connection for assertions.
    pub async fn raw_connection(&self) -> SqliteConnection {
        let options = SqliteConnectOptions::from_str(&self.url).unwrap();
        SqliteConnection::connect_with(&options).await.unwrap()
    }

    pub async fn count(&self, table: &str) -> i64 {
        let mut conn = self.raw_connection().await;
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&mut conn)
            .await
            .unwrap();
        count
    }
}

/// Creates a shop database with customers, orders and products.
pub async fn seeded_database() -> TestDatabase {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sql_agent_class.db");
    let url = format!("sqlite://{}", path.display());

    let options = SqliteConnectOptions::from_str(&url)
        .unwrap()
        .create_if_missing(true);
    let mut conn = SqliteConnection::connect_with(&options).await.unwrap();

    for statement in [
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT)",
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER, total REAL, note TEXT)",
        "CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT, dropshipment_cost REAL)",
        "INSERT INTO customers (id, name, email) VALUES \
         (1, 'Ada', 'ada@example.com'), (2, 'Grace', NULL), (3, 'Edsger', 'ew@example.com')",
        "INSERT INTO products (id, name, dropshipment_cost) VALUES (1, 'lamp', 4.5), (2, 'desk', 12.0)",
        "WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < 500) \
         INSERT INTO orders (id, customer_id, total, note) \
         SELECT n, (n % 3) + 1, n * 1.5, 'order ' || n FROM seq",
    ] {
        sqlx::query(statement).execute(&mut conn).await.unwrap();
    }
    conn.close().await.unwrap();

    TestDatabase {
        _dir: dir,
        path,
        url,
    }
}
