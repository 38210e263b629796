//! Client-side bucket router for a sharded storage cluster.
//!
//! Data is split into a fixed number of virtual buckets, and every bucket
//! lives on exactly one replicaset at a time. This crate provides the
//! router that sits in front of the cluster:
//! - **Bucket resolution** with a local bucket-to-replicaset cache
//! - **Single-bucket calls** that follow bucket migrations until a deadline
//! - **Broadcast calls** (`map_call_rw`) guarded by a storage-side ref
//! - **Discovery** that keeps the cache warm in the background
//!
//! # Features
//!
//! - Pluggable topology providers and transports
//! - Cache invalidation on bucket migration, with transparent retry
//! - Ref/map/unref protocol so a broadcast sees every bucket exactly once
//! - Counters and latency histograms for every call path
//!
//! # Example
//!
//! ```rust,no_run
//! use bucket_router::{
//!     CallOpts, InstanceInfo, ReplicasetInfo, Router, RouterConfig, StaticProvider, TcpConnector,
//! };
//! use serde_json::json;
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut topology = HashMap::new();
//!     topology.insert(
//!         ReplicasetInfo::new(uuid::Uuid::new_v4(), "storage_1"),
//!         vec![InstanceInfo::master("storage_1_a", "127.0.0.1:3301")],
//!     );
//!
//!     let router = Router::new(
//!         RouterConfig::new(3000),
//!         Arc::new(StaticProvider::new(topology)),
//!         Arc::new(TcpConnector::default()),
//!     )
//!     .await?;
//!
//!     // Routed to the replicaset owning bucket 42
//!     let result = router.call_rw(42, "customer_add", vec![json!({"id": 1})]).await?;
//!     println!("{:?}", result.values());
//!
//!     // Executed on every replicaset under a storage ref
//!     let counts = router
//!         .map_call_rw("customer_count", vec![], CallOpts::write())
//!         .await?;
//!     println!("{:?}", counts);
//!
//!     router.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Application Layer                 │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │                 Router API                   │
//! │  • call(bucket, opts, fn, args)              │
//! │  • map_call_rw(fn, args, opts)               │
//! │  • route(bucket) / route_all()               │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌──────────┐  ┌───────────┐  ┌───────────┐
//! │ Topology │  │  Bucket   │  │ Discovery │
//! │ Registry │  │  Cache    │  │   Task    │
//! └──────────┘  └───────────┘  └───────────┘
//!     │
//!     ▼
//! ┌─────────────────────────────────────────────┐
//! │   Connector / ReplicasetConnection (RPC)     │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Retry Model
//!
//! - **Migration**: the cached owner is dropped and the bucket re-resolved
//! - **Transport errors**: retried with the configured [`RetryPolicy`]
//! - **Deadline**: the last observed error is returned once it passes

pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod router;
pub mod testing;
pub mod topology;
pub mod types;

// Re-export main types for convenience
pub use config::{DiscoveryMode, RetryPolicy, RouterConfig, CALL_TIMEOUT_MIN};
pub use error::{
    AssertError, Error, NetworkError, OwnershipError, OwnershipErrorKind, Result,
    StorageCallError,
};
pub use router::{BucketCache, DiscoverySummary, Router, StorageCallResult};
pub use types::{
    BucketId, CallMode, CallOpts, Credentials, InstanceInfo, InstanceRole, PoolMode, RefId,
    ReplicasetCallOpts, ReplicasetId, ReplicasetInfo, RouterStatus, Value,
};

// Re-export topology types
pub use topology::{
    AsyncCall, BucketStatInfo, Replicaset, StaticProvider, TopologyController, TopologyProvider,
};

// Re-export transport types
pub use network::{Connector, ReplicasetConnection, TcpConfig, TcpConnector};

// Re-export metrics types
pub use metrics::{
    Counter, Gauge, Histogram, HistogramSnapshot, LabeledCounter, MetricsSnapshot, RouterMetrics,
    CALL_LATENCY_BUCKETS,
};

// Re-export testing types
pub use testing::{MockConnection, MockConnector, MockStorage, TestCluster};
