//! Single-bucket call scenarios against mock storages.

use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_log::test;

use super::TestCluster;
use crate::config::{DiscoveryMode, RetryPolicy, RouterConfig};
use crate::error::{Error, NetworkError, StorageCallError};
use crate::types::CallOpts;

const TOTAL_BUCKETS: u64 = 100;

fn config() -> RouterConfig {
    RouterConfig::new(TOTAL_BUCKETS).with_discovery_mode(DiscoveryMode::Off)
}

#[test(tokio::test)]
async fn test_out_of_range_bucket_sends_nothing() {
    let cluster = TestCluster::new(2, TOTAL_BUCKETS);
    cluster.register_all("echo", |args| Ok(args));
    let router = cluster.router(config()).await.unwrap();

    for bucket_id in [0, TOTAL_BUCKETS + 1, u64::MAX] {
        let err = router
            .call(bucket_id, CallOpts::read(), "echo", vec![])
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::BucketOutOfRange { total: TOTAL_BUCKETS, .. }),
            "bucket {}: {:?}",
            bucket_id,
            err
        );
    }

    assert_eq!(cluster.total_calls("vshard.storage.bucket_stat"), 0);
    assert_eq!(cluster.total_calls("echo"), 0);
    assert!(router.route(0).await.is_err());
}

#[test(tokio::test)]
async fn test_first_attempt_success() {
    let cluster = TestCluster::new(2, TOTAL_BUCKETS);
    cluster.register_all("echo", |args| Ok(args));
    cluster.register_all("noop", |_| Ok(vec![]));
    let router = cluster.router(config()).await.unwrap();

    let result = router
        .call_ro(7, "echo", vec![json!("hello"), json!(42)])
        .await
        .unwrap();
    assert_eq!(result.values(), &[json!("hello"), json!(42)]);
    assert_eq!(result.decode::<String>().unwrap(), Some("hello".to_string()));
    assert_eq!(cluster.total_calls("echo"), 1);

    let result = router.call_rw(7, "noop", vec![]).await.unwrap();
    assert!(result.values().is_empty());
    assert_eq!(result.decode::<String>().unwrap(), None);

    let snap = router.metrics().snapshot();
    assert_eq!(snap.call_success, 2);
    assert_eq!(snap.call_failures, 0);
}

#[test(tokio::test)]
async fn test_resolution_is_cached() {
    let cluster = TestCluster::new(3, TOTAL_BUCKETS);
    cluster.register_all("echo", |args| Ok(args));
    let router = cluster.router(config()).await.unwrap();

    let owner = router.route(50).await.unwrap();
    assert_eq!(Some(owner.id()), cluster.owner_of(50).map(|i| cluster.id(i)));
    let lookups = cluster.total_calls("vshard.storage.bucket_stat");
    assert!((1..=3).contains(&lookups), "lookups: {}", lookups);

    router.call_ro(50, "echo", vec![]).await.unwrap();
    router.call_ro(50, "echo", vec![]).await.unwrap();
    assert_eq!(cluster.total_calls("vshard.storage.bucket_stat"), lookups);
}

#[test(tokio::test)]
async fn test_bucket_move_invalidates_and_retries() {
    let cluster = TestCluster::new(2, TOTAL_BUCKETS);
    cluster.register_all("echo", |args| Ok(args));
    let router = cluster
        .router(config().with_discovery_mode(DiscoveryMode::Once))
        .await
        .unwrap();

    assert_eq!(router.cached_owner(10), Some(cluster.id(0)));
    cluster.move_bucket(10, 0, 1);

    let result = router
        .call_rw(10, "echo", vec![json!("moved")])
        .await
        .unwrap();
    assert_eq!(result.values(), &[json!("moved")]);
    assert_eq!(router.cached_owner(10), Some(cluster.id(1)));
    assert_eq!(cluster.storage(0).calls("echo"), 0);
    assert_eq!(cluster.storage(1).calls("echo"), 1);
    assert_eq!(router.metrics().snapshot().retries("bucket_migrate"), 1);
}

#[test(tokio::test)]
async fn test_failing_function_returns_last_error_after_deadline() {
    let cluster = TestCluster::new(2, TOTAL_BUCKETS);
    cluster.register_all("fail", |_| Err("assertion failed!".to_string()));
    let router = cluster.router(config()).await.unwrap();

    let timeout = Duration::from_millis(200);
    let start = Instant::now();
    let err = router
        .call(1, CallOpts::write().with_timeout(timeout), "fail", vec![])
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    match err {
        Error::Storage(StorageCallError::Assert(e)) => assert_eq!(e.message, "assertion failed!"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(elapsed >= timeout, "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "returned after {:?}", elapsed);
    assert!(cluster.storage(0).calls("fail") > 1, "assert errors are retried");
    assert_eq!(router.metrics().snapshot().call_failures, 1);
}

#[test(tokio::test)]
async fn test_default_timeout_applies() {
    let cluster = TestCluster::new(1, TOTAL_BUCKETS);
    cluster.register_all("fail", |_| Err("boom".to_string()));
    let router = cluster.router(config()).await.unwrap();

    let start = Instant::now();
    let result = router
        .call(1, CallOpts::read().with_timeout(Duration::ZERO), "fail", vec![])
        .await;
    let elapsed = start.elapsed();

    assert!(result.is_err());
    assert!(elapsed >= Duration::from_millis(500), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "returned after {:?}", elapsed);
}

#[test(tokio::test)]
async fn test_slow_storage_is_bounded_by_deadline() {
    let cluster = TestCluster::new(1, TOTAL_BUCKETS);
    cluster.register_all("echo", |args| Ok(args));
    cluster.storage(0).set_latency(Duration::from_secs(5));
    let router = cluster.router(config()).await.unwrap();

    let start = Instant::now();
    let err = router
        .call(
            1,
            CallOpts::read().with_timeout(Duration::from_millis(100)),
            "echo",
            vec![],
        )
        .await
        .unwrap_err();

    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(
        matches!(err, Error::Network(NetworkError::Timeout) | Error::Timeout),
        "unexpected error: {:?}",
        err
    );
}

#[test(tokio::test)]
async fn test_unavailable_replicaset_fails_resolution() {
    let cluster = TestCluster::new(2, TOTAL_BUCKETS);
    cluster.register_all("echo", |args| Ok(args));
    cluster.storage(1).set_unavailable(true);
    let router = cluster.router(config()).await.unwrap();

    // Buckets of the healthy replicaset still work.
    router.call_ro(1, "echo", vec![]).await.unwrap();

    let err = router
        .call(
            TOTAL_BUCKETS,
            CallOpts::read().with_timeout(Duration::from_millis(100)),
            "echo",
            vec![],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BucketResolve { .. }), "unexpected error: {:?}", err);
    assert!(router.metrics().snapshot().retries("bucket_resolve_error") > 0);
}

#[test(tokio::test)]
async fn test_recovers_when_storage_comes_back() {
    let cluster = Arc::new(TestCluster::new(1, TOTAL_BUCKETS));
    cluster.register_all("echo", |args| Ok(args));
    let router = cluster
        .router(config().with_discovery_mode(DiscoveryMode::Once))
        .await
        .unwrap();
    cluster.storage(0).set_unavailable(true);

    let restore = {
        let cluster = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cluster.storage(0).set_unavailable(false);
        })
    };

    let result = router
        .call(
            5,
            CallOpts::read().with_timeout(Duration::from_secs(2)),
            "echo",
            vec![json!(1)],
        )
        .await
        .unwrap();
    assert_eq!(result.values(), &[json!(1)]);
    assert!(router.metrics().snapshot().retries("future_get_error") > 0);
    restore.await.unwrap();
}

#[test(tokio::test)]
async fn test_backoff_limits_attempts() {
    let cluster = TestCluster::new(1, TOTAL_BUCKETS);
    cluster.register_all("fail", |_| Err("boom".to_string()));
    let router = cluster
        .router(config().with_retry_policy(RetryPolicy::Backoff {
            initial: Duration::from_millis(50),
            max: Duration::from_millis(50),
        }))
        .await
        .unwrap();

    let start = Instant::now();
    let result = router
        .call(
            1,
            CallOpts::read().with_timeout(Duration::from_millis(300)),
            "fail",
            vec![],
        )
        .await;
    assert!(result.is_err());
    assert!(start.elapsed() < Duration::from_secs(1));

    let attempts = cluster.storage(0).calls("fail");
    assert!((2..=8).contains(&attempts), "attempts: {}", attempts);
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_calls() {
    let cluster = TestCluster::new(4, TOTAL_BUCKETS);
    cluster.register_all("echo", |args| Ok(args));
    let router = Arc::new(cluster.router(config()).await.unwrap());

    let handles: Vec<_> = (1..=TOTAL_BUCKETS)
        .map(|bucket_id| {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .call_ro(bucket_id, "echo", vec![json!(bucket_id)])
                    .await
                    .map(|r| r.values().to_vec())
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let values = handle.await.unwrap().unwrap();
        assert_eq!(values, vec![json!(i as u64 + 1)]);
    }
    assert_eq!(router.known_bucket_count(), TOTAL_BUCKETS as usize);
}
