//! Connection abstraction between the router and storage replicasets.
//!
//! The router never talks to sockets directly. Each replicaset owns an
//! `Arc<dyn ReplicasetConnection>` created by the configured [`Connector`],
//! which picks an instance for every call according to the [`PoolMode`].

use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{NetworkError, Result};
use crate::types::{Credentials, InstanceInfo, PoolMode, ReplicasetInfo, Value};

/// Pooled connection to the instances of one replicaset.
#[async_trait]
pub trait ReplicasetConnection: Send + Sync + Debug + 'static {
    /// Call `function` with positional `args` on an instance chosen by `pool_mode`.
    ///
    /// Returns every value the function returned.
    async fn call(
        &self,
        function: &str,
        args: Vec<Value>,
        pool_mode: PoolMode,
    ) -> std::result::Result<Vec<Value>, NetworkError>;

    /// Tear the connection down.
    async fn close(&self) -> std::result::Result<(), NetworkError>;
}

/// Factory for replicaset connections.
#[async_trait]
pub trait Connector: Send + Sync + Debug + 'static {
    /// Open a connection to the given replicaset.
    async fn connect(
        &self,
        info: &ReplicasetInfo,
        instances: &[InstanceInfo],
        credentials: &Credentials,
    ) -> Result<Arc<dyn ReplicasetConnection>>;
}

/// Pick the instance that should serve a call in `pool_mode`.
pub fn select_instance(
    instances: &[InstanceInfo],
    pool_mode: PoolMode,
) -> std::result::Result<&InstanceInfo, NetworkError> {
    let mut rng = rand::thread_rng();
    let chosen = match pool_mode {
        PoolMode::Rw => instances.iter().find(|i| i.is_master()),
        PoolMode::Ro => {
            let replicas: Vec<&InstanceInfo> = instances.iter().filter(|i| !i.is_master()).collect();
            replicas.choose(&mut rng).copied()
        }
        PoolMode::Any => instances.choose(&mut rng),
    };

    chosen.ok_or_else(|| NetworkError::NoInstance(pool_mode.to_string()))
}
