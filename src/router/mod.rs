//! The bucket router.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Router                             │
//! │                                                              │
//! │   call / call_ro / call_rw          map_call_rw              │
//! │          │                               │                   │
//! │          ▼                               ▼                   │
//! │   ┌──────────────┐   invalidate   ┌──────────────┐          │
//! │   │ BucketCache  │◄───────────────│  ref / map / │          │
//! │   │ (DashMap)    │                │  unref       │          │
//! │   └──────▲───────┘                └──────┬───────┘          │
//! │          │ merge                         │ snapshot         │
//! │   ┌──────┴───────┐   snapshot     ┌──────▼───────┐          │
//! │   │  Discovery   │───────────────►│  Topology    │          │
//! │   │  sweeper     │                │  (ArcSwap)   │          │
//! │   └──────────────┘                └──────────────┘          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let router = Router::new(config, provider, connector).await?;
//!
//! let result = router.call_rw(bucket_id, "customer_add", vec![json!(customer)]).await?;
//! let per_replicaset = router.map_call_rw("customer_count", vec![], CallOpts::write()).await?;
//!
//! router.close().await;
//! ```

mod call;
mod discovery;
mod map_call;
mod resolver;

pub use call::StorageCallResult;
pub use discovery::DiscoverySummary;
pub use resolver::BucketCache;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::config::{DiscoveryMode, RouterConfig};
use crate::error::{Error, Result};
use crate::metrics::RouterMetrics;
use crate::network::Connector;
use crate::topology::{
    validate_replicaset_info, Replicaset, TopologyController, TopologyProvider, TopologyRegistry,
};
use crate::types::{BucketId, InstanceInfo, ReplicasetId, ReplicasetInfo, RouterStatus};
use discovery::DiscoveryTask;

/// State shared between the router handle and its background task.
#[derive(Debug)]
pub(crate) struct RouterInner {
    pub(crate) config: RouterConfig,
    pub(crate) topology: TopologyRegistry,
    pub(crate) cache: BucketCache,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) next_ref_id: AtomicU64,
    pub(crate) metrics: RouterMetrics,
}

/// Client-side router for a bucket-sharded cluster.
#[derive(Debug)]
pub struct Router {
    inner: Arc<RouterInner>,
    provider: Arc<dyn TopologyProvider>,
    discovery: Mutex<Option<DiscoveryTask>>,
}

impl Router {
    /// Build a router, load the topology from `provider` and run discovery
    /// as configured.
    ///
    /// With [`DiscoveryMode::Once`] or [`DiscoveryMode::On`] the first sweep
    /// finishes before this returns.
    pub async fn new(
        config: RouterConfig,
        provider: Arc<dyn TopologyProvider>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        provider.validate()?;

        let inner = Arc::new(RouterInner {
            cache: BucketCache::new(config.total_bucket_count),
            config,
            topology: TopologyRegistry::new(),
            connector,
            next_ref_id: AtomicU64::new(1),
            metrics: RouterMetrics::new(),
        });

        let router = Self {
            inner,
            provider,
            discovery: Mutex::new(None),
        };

        if let Err(e) = router.provider.init(&router).await {
            tracing::warn!(error = %e, "Topology provider failed, closing router");
            router.close().await;
            return Err(e);
        }

        tracing::info!(
            replicasets = router.inner.topology.len(),
            total_buckets = router.inner.config.total_bucket_count,
            discovery = ?router.inner.config.discovery_mode,
            "Router started"
        );

        match router.inner.config.discovery_mode {
            DiscoveryMode::Off => {}
            DiscoveryMode::Once => {
                router.discovery_sweep().await;
            }
            DiscoveryMode::On => {
                router.discovery_sweep().await;
                let task = DiscoveryTask::spawn(
                    Arc::downgrade(&router.inner),
                    router.inner.config.discovery_interval,
                );
                *router.discovery.lock() = Some(task);
            }
        }

        Ok(router)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.inner.metrics
    }

    /// Every replicaset in the topology.
    ///
    /// The map is a copy; changing it does not affect the router.
    pub fn route_all(&self) -> HashMap<ReplicasetId, Arc<Replicaset>> {
        HashMap::clone(&self.inner.topology.snapshot())
    }

    /// Pin `bucket_id` to `replicaset` until the next invalidation or sweep.
    pub fn bucket_set(&self, bucket_id: BucketId, replicaset: ReplicasetId) -> Result<()> {
        if !self.inner.topology.contains(&replicaset) {
            return Err(Error::ReplicasetNotFound(replicaset));
        }
        self.inner.cache.set(bucket_id, replicaset)?;
        self.update_gauges();
        Ok(())
    }

    /// Forget the cached owner of `bucket_id`.
    pub fn bucket_reset(&self, bucket_id: BucketId) {
        self.inner.cache.invalidate(bucket_id);
        self.update_gauges();
    }

    /// Forget every cached owner.
    pub fn route_map_clean(&self) {
        self.inner.cache.clear();
        self.update_gauges();
    }

    /// Cached owner of `bucket_id`, without any lookup.
    pub fn cached_owner(&self, bucket_id: BucketId) -> Option<ReplicasetId> {
        self.inner.cache.get(bucket_id)
    }

    /// Number of buckets with a cached owner.
    pub fn known_bucket_count(&self) -> usize {
        self.inner.cache.known_count()
    }

    pub fn status(&self) -> RouterStatus {
        RouterStatus {
            replicasets: self.inner.topology.len(),
            known_buckets: self.inner.cache.known_count(),
            total_buckets: self.inner.cache.total_bucket_count(),
        }
    }

    /// Run one discovery sweep now.
    pub async fn discovery_sweep(&self) -> DiscoverySummary {
        self.inner.discovery_sweep().await
    }

    /// Stop discovery and close every replicaset connection.
    pub async fn close(&self) {
        let task = self.discovery.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }

        self.provider.close().await;

        for e in self.inner.topology.clear().await {
            tracing::warn!(error = %e, "Error while closing replicaset");
        }
        self.inner.cache.clear();
        self.update_gauges();

        tracing::info!("Router closed");
    }

    fn update_gauges(&self) {
        let metrics = &self.inner.metrics;
        metrics.replicasets.set(self.inner.topology.len() as i64);
        metrics
            .known_buckets
            .set(self.inner.cache.known_count() as i64);
    }
}

#[async_trait]
impl TopologyController for Router {
    async fn add_replicaset(
        &self,
        info: ReplicasetInfo,
        instances: Vec<InstanceInfo>,
    ) -> Result<()> {
        validate_replicaset_info(&info)?;
        if instances.is_empty() {
            return Err(Error::Config(format!("replicaset {} has no instances", info)));
        }
        if self.inner.topology.contains(&info.id) {
            return Err(Error::ReplicasetAlreadyExists(info.id));
        }

        let conn = self
            .inner
            .connector
            .connect(&info, &instances, &self.inner.config.credentials)
            .await?;
        let replicaset = Arc::new(Replicaset::new(info, instances, conn));

        if let Err(e) = self.inner.topology.add(Arc::clone(&replicaset)) {
            // Lost a race with a concurrent add of the same id.
            if let Err(close_err) = replicaset.close().await {
                tracing::debug!(error = %close_err, "Failed to close duplicate connection");
            }
            return Err(e);
        }

        tracing::info!(
            replicaset = %replicaset.info(),
            instances = replicaset.instances().len(),
            "Replicaset added"
        );
        self.update_gauges();
        Ok(())
    }

    async fn remove_replicaset(&self, id: ReplicasetId) -> Vec<Error> {
        let errors = self.inner.topology.remove(id).await;
        self.inner.cache.forget_replicaset(id);
        self.update_gauges();

        if !matches!(errors.as_slice(), [Error::ReplicasetNotFound(_)]) {
            tracing::info!(replicaset = %id, errors = errors.len(), "Replicaset removed");
        }
        errors
    }
}

impl Router {
    /// Connect to and register a replicaset.
    pub async fn add_replicaset(
        &self,
        info: ReplicasetInfo,
        instances: Vec<InstanceInfo>,
    ) -> Result<()> {
        TopologyController::add_replicaset(self, info, instances).await
    }

    /// Unregister a replicaset and drop its cached buckets.
    ///
    /// Connection teardown errors are returned; the replicaset is removed
    /// regardless.
    pub async fn remove_replicaset(&self, id: ReplicasetId) -> Vec<Error> {
        TopologyController::remove_replicaset(self, id).await
    }
}
