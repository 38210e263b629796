//! Testing utilities for the router.
//!
//! - [`MockConnection`]: a connection answering scripted handlers
//! - [`MockStorage`]: a simulated storage node with buckets, refs and
//!   storage functions
//! - [`TestCluster`]: several mock storages sharing the bucket space, wired
//!   into a static topology
//!
//! # Example
//!
//! ```rust,ignore
//! use bucket_router::testing::TestCluster;
//!
//! let cluster = TestCluster::new(2, 100);
//! cluster.register_all("echo", |args| Ok(args));
//!
//! let router = cluster.router(RouterConfig::new(100)).await?;
//! let result = router.call_ro(1, "echo", vec![json!("hi")]).await?;
//!
//! // Move a bucket to the other replicaset behind the router's back.
//! cluster.move_bucket(1, 0, 1);
//! ```

mod mock;

#[cfg(test)]
mod router_call_tests;

pub use mock::{MockConnection, MockConnector, MockStorage, StorageFn, DISCOVERY_PAGE_SIZE};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::RouterConfig;
use crate::error::Result;
use crate::router::Router;
use crate::topology::StaticProvider;
use crate::types::{BucketId, InstanceInfo, ReplicasetId, ReplicasetInfo, Value};

/// Mock storages splitting `[1, total]` into contiguous ranges.
#[derive(Debug)]
pub struct TestCluster {
    pub replicasets: Vec<(ReplicasetInfo, Arc<MockStorage>)>,
    pub connector: Arc<MockConnector>,
    pub total_buckets: u64,
}

impl TestCluster {
    /// Create `replicaset_count` storages with buckets spread evenly.
    pub fn new(replicaset_count: usize, total_buckets: u64) -> Self {
        let connector = MockConnector::new();
        let count = replicaset_count.max(1) as u64;
        let per_replicaset = total_buckets / count;

        let replicasets = (0..count)
            .map(|i| {
                let first = i * per_replicaset + 1;
                let last = if i + 1 == count {
                    total_buckets
                } else {
                    (i + 1) * per_replicaset
                };

                let info = ReplicasetInfo::new(Uuid::new_v4(), format!("storage_{}", i + 1));
                let storage = MockStorage::new(first..=last);
                connector.register(info.id, storage.clone());
                (info, storage)
            })
            .collect();

        Self {
            replicasets,
            connector,
            total_buckets,
        }
    }

    /// Static topology with one master and one replica per replicaset.
    pub fn provider(&self) -> Arc<StaticProvider> {
        let topology: HashMap<ReplicasetInfo, Vec<InstanceInfo>> = self
            .replicasets
            .iter()
            .map(|(info, _)| {
                let instances = vec![
                    InstanceInfo::master(format!("{}_a", info.name), "mock://a"),
                    InstanceInfo::replica(format!("{}_b", info.name), "mock://b"),
                ];
                (info.clone(), instances)
            })
            .collect();
        Arc::new(StaticProvider::new(topology))
    }

    /// Build a router over this cluster.
    pub async fn router(&self, config: RouterConfig) -> Result<Router> {
        Router::new(config, self.provider(), self.connector.clone()).await
    }

    pub fn id(&self, index: usize) -> ReplicasetId {
        self.replicasets[index].0.id
    }

    pub fn info(&self, index: usize) -> &ReplicasetInfo {
        &self.replicasets[index].0
    }

    pub fn storage(&self, index: usize) -> &Arc<MockStorage> {
        &self.replicasets[index].1
    }

    /// Index of the storage holding `bucket_id`.
    pub fn owner_of(&self, bucket_id: BucketId) -> Option<usize> {
        self.replicasets
            .iter()
            .position(|(_, storage)| storage.owns(bucket_id))
    }

    /// Move `bucket_id` between two storages.
    pub fn move_bucket(&self, bucket_id: BucketId, from: usize, to: usize) {
        let target = self.storage(to).clone();
        self.storage(from).move_bucket(bucket_id, &target);
    }

    /// Register `function` on every storage.
    pub fn register_all<F>(&self, name: &str, function: F)
    where
        F: Fn(Vec<Value>) -> std::result::Result<Vec<Value>, String>
            + Clone
            + Send
            + Sync
            + 'static,
    {
        for (_, storage) in &self.replicasets {
            storage.register(name, function.clone());
        }
    }

    /// Sum of `function` calls across storages.
    pub fn total_calls(&self, function: &str) -> usize {
        self.replicasets
            .iter()
            .map(|(_, storage)| storage.calls(function))
            .sum()
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_covers_every_bucket_once() {
        let cluster = TestCluster::new(3, 100);

        let total: usize = cluster
            .replicasets
            .iter()
            .map(|(_, s)| s.bucket_count())
            .sum();
        assert_eq!(total, 100);
        assert_eq!(cluster.owner_of(1), Some(0));
        assert_eq!(cluster.owner_of(100), Some(2));
        assert_eq!(cluster.owner_of(101), None);
    }

    #[test]
    fn test_move_bucket() {
        let cluster = TestCluster::new(2, 10);
        cluster.move_bucket(1, 0, 1);
        assert_eq!(cluster.owner_of(1), Some(1));
        assert_eq!(cluster.storage(0).bucket_count(), 4);
        assert_eq!(cluster.storage(1).bucket_count(), 6);
    }

    #[tokio::test]
    async fn test_wait_for() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag_clone.store(true, Ordering::Relaxed);
        });

        assert!(wait_for(|| flag.load(Ordering::Relaxed), Duration::from_millis(500)).await);
    }
}
