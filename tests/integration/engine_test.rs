//! End-to-end guarded query tests.
//!
//! Drives `execute_guarded_query` against a real SQLite file.

use super::{seeded_database, ORDER_ROWS};
use sql_guardrail::config::Config;
use sql_guardrail::db::Value;
use sql_guardrail::engine::{CallerContext, GuardedEngine};
use sql_guardrail::error::ErrorKind;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

/// CPU-bound query that runs for seconds unless interrupted.
const SLOW_COUNT: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c \
                          WHERE x < 30000000) SELECT count(*) FROM c";

#[tokio::test]
async fn test_chained_drop_rejected_and_table_intact() {
    let db = seeded_database().await;
    let engine = db.engine();

    let err = assert_err!(
        engine
            .execute_guarded_query(
                "SELECT name FROM customers; DROP TABLE customers;",
                &CallerContext::new(),
            )
            .await
    );

    assert_eq!(err.kind(), ErrorKind::MultipleStatements);
    assert_eq!(db.count("customers").await, 3);
    assert_eq!(engine.pool_status().live, 0);
}

#[tokio::test]
async fn test_commented_drop_runs_with_default_limit() {
    let db = seeded_database().await;
    let engine = db.engine();

    let result = assert_ok!(
        engine
            .execute_guarded_query(
                "select * from orders -- DROP TABLE orders",
                &CallerContext::new(),
            )
            .await
    );

    assert_eq!(result.row_count(), 100);
    assert_eq!(result.columns(), ["id", "customer_id", "total", "note"]);
    assert_eq!(db.count("orders").await, ORDER_ROWS);
}

#[tokio::test]
async fn test_large_limit_clamped() {
    let db = seeded_database().await;
    let engine = db.engine();

    let result = assert_ok!(
        engine
            .execute_guarded_query("SELECT * FROM orders LIMIT 5000", &CallerContext::new())
            .await
    );

    assert_eq!(result.row_count(), 200);
}

#[tokio::test]
async fn test_small_limit_respected() {
    let db = seeded_database().await;
    let engine = db.engine();

    let result = assert_ok!(
        engine
            .execute_guarded_query(
                "SELECT id FROM orders ORDER BY id LIMIT 5 OFFSET 10",
                &CallerContext::new(),
            )
            .await
    );

    assert_eq!(result.row_count(), 5);
    assert_eq!(result.rows()[0], vec![Value::Int(11)]);
}

#[tokio::test]
async fn test_column_containing_denied_word() {
    let db = seeded_database().await;
    let engine = db.engine();

    let result = assert_ok!(
        engine
            .execute_guarded_query(
                "SELECT dropshipment_cost FROM products ORDER BY id",
                &CallerContext::new(),
            )
            .await
    );

    assert_eq!(
        result.rows(),
        [vec![Value::Float(4.5)], vec![Value::Float(12.0)]]
    );
}

#[tokio::test]
async fn test_cte_query() {
    let db = seeded_database().await;
    let engine = db.engine();

    let result = assert_ok!(
        engine
            .execute_guarded_query(
                "WITH big AS (SELECT customer_id, SUM(total) AS spent FROM orders GROUP BY customer_id) \
                 SELECT c.name, b.spent FROM customers c JOIN big b ON b.customer_id = c.id ORDER BY c.id",
                &CallerContext::new(),
            )
            .await
    );

    assert_eq!(result.row_count(), 3);
    assert_eq!(result.rows()[0][0], Value::Text("Ada".to_string()));
}

#[tokio::test]
async fn test_null_values() {
    let db = seeded_database().await;
    let engine = db.engine();

    let result = assert_ok!(
        engine
            .execute_guarded_query(
                "SELECT email FROM customers WHERE id = 2",
                &CallerContext::new(),
            )
            .await
    );

    assert_eq!(result.rows(), [vec![Value::Null]]);
}

#[tokio::test]
async fn test_unknown_column_is_execution_failed() {
    let db = seeded_database().await;
    let engine = db.engine();

    let err = assert_err!(
        engine
            .execute_guarded_query("SELECT shoe_size FROM customers", &CallerContext::new())
            .await
    );

    assert_eq!(err.kind(), ErrorKind::ExecutionFailed);
    assert!(!err.message().contains("shoe_size"));
    assert!(!err.message().contains("customers"));

    // The connection went back to the pool and is reused.
    assert_eq!(engine.pool_status().idle, 1);
    assert_ok!(
        engine
            .execute_guarded_query("SELECT id FROM customers", &CallerContext::new())
            .await
    );
    assert_eq!(engine.pool_status().live, 1);
}

#[tokio::test]
async fn test_denied_operations_never_touch_data() {
    let db = seeded_database().await;
    let engine = db.engine();

    for sql in [
        "DELETE FROM orders",
        "UPDATE customers SET name = 'x'",
        "PRAGMA table_info(customers)",
        "SELECT * FROM customers WHERE name IN (SELECT 1) DrOp",
        "ATTACH DATABASE 'evil.db' AS evil",
    ] {
        let err = assert_err!(
            engine
                .execute_guarded_query(sql, &CallerContext::new())
                .await
        );
        assert_eq!(err.kind(), ErrorKind::DisallowedOperation, "SQL: '{}'", sql);
    }

    assert_eq!(db.count("orders").await, ORDER_ROWS);
    assert_eq!(engine.pool_status().live, 0);
}

#[tokio::test]
async fn test_missing_database_is_pool_exhausted() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("missing.db");
    let mut config = Config::default();
    config.database.url = format!("sqlite://{}", path.display());
    let engine = GuardedEngine::start(&config).unwrap();

    let err = assert_err!(
        engine
            .execute_guarded_query("SELECT 1", &CallerContext::new())
            .await
    );

    assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    assert!(!engine.health_check().await);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_health_check_and_shutdown() {
    let db = seeded_database().await;
    let engine = db.engine();

    assert!(engine.health_check().await);
    engine.shutdown().await;

    let err = assert_err!(
        engine
            .execute_guarded_query("SELECT 1", &CallerContext::new())
            .await
    );
    assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    assert!(db.path.exists());
}

#[tokio::test]
async fn test_result_serializes_for_callers() {
    let db = seeded_database().await;
    let engine = db.engine();

    let result = assert_ok!(
        engine
            .execute_guarded_query(
                "SELECT id, name FROM customers ORDER BY id LIMIT 1",
                &CallerContext::new().with_request_id("req-42"),
            )
            .await
    );

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["columns"], serde_json::json!(["id", "name"]));
    assert_eq!(json["rows"], serde_json::json!([[1, "Ada"]]));
    assert_eq!(json["row_count"], 1);
    assert!(json["execution_time"].is_u64());
}

#[tokio::test]
async fn test_statement_timeout_stops_running_query() {
    let db = seeded_database().await;
    let mut config = db.config();
    config.pool.statement_timeout_ms = 200;
    let engine = GuardedEngine::start(&config).unwrap();

    let started = Instant::now();
    let err = assert_err!(
        engine
            .execute_guarded_query(SLOW_COUNT, &CallerContext::new())
            .await
    );

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(
        started.elapsed() < Duration::from_millis(1_500),
        "timed out after {:?}",
        started.elapsed()
    );
    assert_eq!(engine.pool_status().in_use, 0);

    let result = assert_ok!(
        engine
            .execute_guarded_query("SELECT count(*) FROM customers", &CallerContext::new())
            .await
    );
    assert_eq!(result.rows(), [vec![Value::Int(3)]]);
    assert_eq!(engine.pool_status().in_use, 0);
}

#[tokio::test]
async fn test_cancellation_stops_running_query() {
    let db = seeded_database().await;
    let engine = db.engine();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = assert_err!(
        engine
            .execute_guarded_query(SLOW_COUNT, &CallerContext::new().with_cancellation(token))
            .await
    );

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_millis(1_500));
    assert_eq!(engine.pool_status().in_use, 0);
    assert_ok!(
        engine
            .execute_guarded_query("SELECT id FROM customers", &CallerContext::new())
            .await
    );
}
