//! Pool behavior under concurrent load against SQLite.

use super::seeded_database;
use futures::future::join_all;
use sql_guardrail::engine::{CallerContext, GuardedEngine};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_queries_share_bounded_pool() {
    let db = seeded_database().await;
    let mut config = db.config();
    config.pool.pool_size = 3;
    config.pool.acquire_timeout_ms = 10_000;
    let engine = GuardedEngine::start(&config).unwrap();
    let ctx = CallerContext::new();

    let results = join_all((0..24).map(|i| {
        let engine = &engine;
        let ctx = &ctx;
        async move {
            let sql = format!("SELECT id, total FROM orders WHERE customer_id = {}", i % 3 + 1);
            let result = engine.execute_guarded_query(&sql, ctx).await;
            assert!(engine.pool_status().live <= 3);
            result
        }
    }))
    .await;

    for result in &results {
        let result = result.as_ref().expect("query should succeed");
        assert!(result.row_count() <= 100);
    }

    let status = engine.pool_status();
    assert!(status.live <= 3);
    assert_eq!(status.in_use, 0);
    assert_eq!(status.idle, status.live);
}

#[tokio::test]
async fn test_failed_queries_do_not_leak_connections() {
    let db = seeded_database().await;
    let mut config = db.config();
    config.pool.pool_size = 2;
    let engine = GuardedEngine::start(&config).unwrap();
    let ctx = CallerContext::new();

    for _ in 0..10 {
        let _ = engine
            .execute_guarded_query("SELECT missing FROM orders", &ctx)
            .await;
    }

    let status = engine.pool_status();
    assert_eq!(status.in_use, 0);
    assert!(status.live <= 2);
    assert!(engine.health_check().await);
}
