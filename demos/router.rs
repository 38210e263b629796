//! Router against a running storage cluster.
//!
//! Expects two storage replicasets listening on 127.0.0.1:3301/3302
//! (masters) and 127.0.0.1:3311/3312 (replicas), each exposing a
//! `customer_add` and a `customer_count` function.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example router
//!   RUST_LOG=bucket_router=debug cargo run --example router -- 5000

use bucket_router::{
    CallOpts, DiscoveryMode, InstanceInfo, ReplicasetInfo, RetryPolicy, Router, RouterConfig,
    StaticProvider, TcpConfig, TcpConnector,
};
use serde_json::json;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Master and replica address of each replicaset.
const REPLICASETS: [(&str, &str); 2] = [
    ("127.0.0.1:3301", "127.0.0.1:3311"),
    ("127.0.0.1:3302", "127.0.0.1:3312"),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let total_buckets: u64 = env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(3000);

    let mut topology = HashMap::new();
    for (i, (master, replica)) in REPLICASETS.into_iter().enumerate() {
        let name = format!("storage_{}", i + 1);
        topology.insert(
            ReplicasetInfo::new(Uuid::new_v4(), name.clone()),
            vec![
                InstanceInfo::master(format!("{}_a", name), master),
                InstanceInfo::replica(format!("{}_b", name), replica),
            ],
        );
    }

    let config = RouterConfig::new(total_buckets)
        .with_discovery_mode(DiscoveryMode::On)
        .with_discovery_interval(Duration::from_secs(5))
        .with_credentials("storage", "storage")
        .with_retry_policy(RetryPolicy::Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(200),
        });

    let connector = TcpConnector::new(TcpConfig {
        connect_timeout: Duration::from_secs(1),
    });

    println!("===========================================");
    println!("  Bucket Router Example ({} buckets)", total_buckets);
    println!("===========================================");

    let router = Router::new(
        config,
        Arc::new(StaticProvider::new(topology)),
        Arc::new(connector),
    )
    .await?;

    let status = router.status();
    println!(
        "Router ready: {} replicasets, {} buckets known",
        status.replicasets, status.known_buckets
    );

    // Single-bucket writes
    for customer_id in 1..=10u64 {
        let bucket_id = customer_id % total_buckets + 1;
        match router
            .call_rw(
                bucket_id,
                "customer_add",
                vec![json!({"customer_id": customer_id, "bucket_id": bucket_id})],
            )
            .await
        {
            Ok(result) => println!(
                "customer {} -> bucket {}: {:?}",
                customer_id,
                bucket_id,
                result.values()
            ),
            Err(e) => println!(
                "customer {} -> bucket {}: error {}",
                customer_id, bucket_id, e
            ),
        }
    }

    // Broadcast read over every replicaset
    match router
        .map_call_rw_typed::<u64>(
            "customer_count",
            vec![],
            CallOpts::write().with_timeout(Duration::from_secs(2)),
        )
        .await
    {
        Ok(counts) => {
            for (replicaset, count) in counts {
                println!("replicaset {}: {:?} customers", replicaset, count);
            }
        }
        Err(e) => println!("map_call_rw failed: {}", e),
    }

    let snapshot = router.metrics().snapshot();
    println!(
        "calls ok={} failed={} map ok={} failed={}",
        snapshot.call_success,
        snapshot.call_failures,
        snapshot.map_call_success,
        snapshot.map_call_failures
    );

    router.close().await;
    Ok(())
}
