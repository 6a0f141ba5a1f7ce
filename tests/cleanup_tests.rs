//! Background cleanup, warm-up requests and leak detection through the pool.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use common::*;
use rustible_pool::config::{
    AdvancedPoolConfig, CleanupSettings, ExhaustionPolicy, LeakDetectionConfig, PoolConfig,
};
use rustible_pool::connection::ConnectionFactory;
use rustible_pool::context::Context;
use rustible_pool::pool::ConnectionPool;

fn idle_config(max_idle: Duration) -> AdvancedPoolConfig {
    let base = quiet_config(4, ExhaustionPolicy::Block);
    let pool = base.pool.clone().max_idle_time(max_idle);
    base.with_pool(pool)
}

#[tokio::test]
async fn test_idle_connection_closed_exactly_once() {
    let factory = MockFactory::new();
    let tracer = RecordingTracer::new();
    let pool = traced_pool(&factory, &tracer, idle_config(Duration::from_millis(100)));
    let key = pool.register(destination("web1")).unwrap();

    let conn = pool.get(&Context::background(), &key).await.unwrap();
    pool.release(&key, &conn).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let result = pool.cleanup_manager().run_cleanup().await;
    assert_eq!(result.idle_connections_cleaned, 1);
    assert_eq!(result.total_cleaned(), 1);
    assert!(result.errors.is_empty());

    let again = pool.cleanup_manager().run_cleanup().await;
    assert_eq!(again.total_cleaned(), 0);

    assert_eq!(factory.connection(0).close_count(), 1);
    assert_eq!(pool.connections_for(&key), 0);
    assert_eq!(tracer.count("connection_evicted"), 1);
    assert_eq!(tracer.count("cleanup_completed"), 2);

    let stats = pool.stats().cleanup;
    assert_eq!(stats.cycles, 2);
    assert_eq!(stats.idle_cleaned, 1);
}

#[tokio::test]
async fn test_active_connection_is_never_cleaned() {
    let factory = MockFactory::new();
    let pool = build_pool(&factory, idle_config(Duration::from_millis(50)));
    let key = pool.register(destination("web1")).unwrap();

    let held = pool.get(&Context::background(), &key).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let result = pool.cleanup_manager().run_cleanup().await;
    assert_eq!(result.total_cleaned(), 0);
    assert_eq!(factory.connection(0).close_count(), 0);

    pool.release(&key, &held).await.unwrap();
    assert_eq!(pool.stats().idle_connections, 1);
}

#[tokio::test]
async fn test_background_cleanup_evicts_idle_connections() {
    let factory = MockFactory::new();
    let base = idle_config(Duration::from_millis(50));
    let pool_config = base
        .pool
        .clone()
        .cleanup_interval(Duration::from_millis(30));
    let pool = build_pool(&factory, base.with_pool(pool_config));
    let key = pool.register(destination("web1")).unwrap();

    let conn = pool.get(&Context::background(), &key).await.unwrap();
    pool.release(&key, &conn).await.unwrap();
    pool.start().unwrap();
    assert!(pool.cleanup_manager().is_running());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(pool.connections_for(&key), 0);
    assert_eq!(factory.connection(0).close_count(), 1);

    pool.close().await.unwrap();
    assert!(!pool.cleanup_manager().is_running());
}

#[tokio::test]
async fn test_disabled_cleanup_does_not_start() {
    let factory = MockFactory::new();
    let config = quiet_config(2, ExhaustionPolicy::Block).with_cleanup(CleanupSettings {
        enabled: false,
        ..CleanupSettings::default()
    });
    let pool = build_pool(&factory, config);
    pool.start().unwrap();
    assert!(!pool.cleanup_manager().is_running());
    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_maintain_prewarms_missing_connections() {
    let factory = MockFactory::new();
    let config = quiet_config(4, ExhaustionPolicy::Block).with_cleanup(CleanupSettings {
        min_connections: 2,
        ..CleanupSettings::default()
    });
    let pool = build_pool(&factory, config);
    let web = pool.register(destination("web1")).unwrap();
    let db = pool.register(destination("db1")).unwrap();

    let result = pool.maintain(&Context::background()).await.unwrap();
    assert_eq!(result.warmup_requests.len(), 2);
    assert!(result.warmup_requests.iter().all(|r| r.missing == 2));

    assert_eq!(pool.connections_for(&web), 2);
    assert_eq!(pool.connections_for(&db), 2);
    assert_eq!(factory.created(), 4);

    let result = pool.maintain(&Context::background()).await.unwrap();
    assert!(result.warmup_requests.is_empty());
}

#[tokio::test]
async fn test_graceful_shutdown_runs_final_cycle() {
    let factory = MockFactory::new();
    let pool = build_pool(&factory, idle_config(Duration::from_millis(20)));
    let key = pool.register(destination("web1")).unwrap();

    let conn = pool.get(&Context::background(), &key).await.unwrap();
    pool.release(&key, &conn).await.unwrap();
    pool.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = pool.cleanup_manager().graceful_shutdown().await;
    assert_eq!(result.idle_connections_cleaned, 1);
    assert!(!pool.cleanup_manager().is_running());
}

#[tokio::test]
async fn test_custom_strategy_drives_policy_eviction() {
    use rustible_pool::pool::strategy::CustomStrategy;

    let factory = MockFactory::new();
    let strategy = CustomStrategy::new(
        "evict-everything-idle",
        |entries| entries.iter().find(|e| !e.in_use()).map(|e| e.id),
        |entry, _config| !entry.in_use(),
    );
    let pool = ConnectionPool::builder(Arc::clone(&factory) as Arc<dyn ConnectionFactory>)
        .config(quiet_config(4, ExhaustionPolicy::Block))
        .eviction_strategy(strategy)
        .build()
        .unwrap();
    let key = pool.register(destination("web1")).unwrap();

    let conn = pool.get(&Context::background(), &key).await.unwrap();
    pool.release(&key, &conn).await.unwrap();

    let result = pool.cleanup_manager().run_cleanup().await;
    assert_eq!(result.policy_connections_cleaned, 1);
    assert_eq!(pool.strategies().eviction().name(), "evict-everything-idle");
}

// ============================================================================
// Leak detection
// ============================================================================

#[tokio::test]
async fn test_leak_callback_fires_for_long_lived_connection() {
    let factory = MockFactory::new();
    let leaks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&leaks);

    let config =
        quiet_config(2, ExhaustionPolicy::Block)
            .with_cleanup(CleanupSettings {
                enabled: false,
                ..CleanupSettings::default()
            })
            .with_leak_detection(LeakDetectionConfig {
                enabled: true,
                check_interval: Duration::from_millis(20),
                warning_threshold: Duration::from_millis(40),
                max_lifetime: Duration::from_millis(80),
            });
    let pool = ConnectionPool::builder(Arc::clone(&factory) as Arc<dyn ConnectionFactory>)
        .config(config)
        .on_leak(move |record| {
            assert_eq!(record.use_count, 1);
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    let key = pool.register(destination("web1")).unwrap();

    let _held = pool.get(&Context::background(), &key).await.unwrap();
    pool.start().unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(leaks.load(Ordering::SeqCst), 1);
    assert_eq!(pool.leak_detector().suspected_leaks().len(), 1);
    pool.close().await.unwrap();
    assert_eq!(pool.leak_detector().tracked(), 0);
}

#[tokio::test]
async fn test_evicted_connection_leaves_leak_ledger() {
    let factory = MockFactory::new();
    let pool = build_pool(&factory, idle_config(Duration::from_millis(20)));
    let key = pool.register(destination("web1")).unwrap();

    let conn = pool.get(&Context::background(), &key).await.unwrap();
    pool.release(&key, &conn).await.unwrap();
    assert_eq!(pool.leak_detector().tracked(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.cleanup_manager().run_cleanup().await;
    assert_eq!(pool.leak_detector().tracked(), 0);
}

#[tokio::test]
async fn test_pool_config_round_trips_through_builder() {
    let factory = MockFactory::new();
    let config = quiet_config(7, ExhaustionPolicy::FailFast);
    let pool = build_pool(&factory, config.clone());
    assert_eq!(pool.config(), &config);
    assert_eq!(
        pool.config().pool,
        PoolConfig::new()
            .max_connections(7)
            .exhaustion_policy(ExhaustionPolicy::FailFast)
            .acquire_timeout(Duration::from_secs(5))
    );
}
