//! Topology sources.
//!
//! A [`TopologyProvider`] feeds replicasets into the router through the
//! [`TopologyController`] it receives on startup. Dynamic providers (a
//! discovery service, a config watcher) keep the controller and apply
//! changes later; [`StaticProvider`] applies a fixed map once.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;

use crate::error::{Error, Result};
use crate::types::{InstanceInfo, ReplicasetId, ReplicasetInfo};

/// Mutation surface of the router topology.
#[async_trait]
pub trait TopologyController: Send + Sync {
    /// Connect to and register a replicaset.
    async fn add_replicaset(&self, info: ReplicasetInfo, instances: Vec<InstanceInfo>)
        -> Result<()>;

    /// Unregister a replicaset, returning teardown errors.
    async fn remove_replicaset(&self, id: ReplicasetId) -> Vec<Error>;
}

/// Source of the cluster topology.
#[async_trait]
pub trait TopologyProvider: Send + Sync + Debug {
    /// Check the topology before the router accepts it.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Push the initial topology into `controller`.
    async fn init(&self, controller: &dyn TopologyController) -> Result<()>;

    /// Stop producing updates.
    async fn close(&self) {}
}

/// Reject descriptors with an empty name or a nil id.
pub fn validate_replicaset_info(info: &ReplicasetInfo) -> Result<()> {
    if info.name.trim().is_empty() {
        return Err(Error::Config(format!(
            "replicaset {} has an empty name",
            info.id
        )));
    }
    if info.id.is_nil() {
        return Err(Error::Config(format!(
            "replicaset {:?} has no id",
            info.name
        )));
    }
    Ok(())
}

/// Fixed topology given at construction time.
#[derive(Debug, Clone)]
pub struct StaticProvider {
    replicasets: HashMap<ReplicasetInfo, Vec<InstanceInfo>>,
}

impl StaticProvider {
    pub fn new(replicasets: HashMap<ReplicasetInfo, Vec<InstanceInfo>>) -> Self {
        Self { replicasets }
    }

    pub fn replicasets(&self) -> &HashMap<ReplicasetInfo, Vec<InstanceInfo>> {
        &self.replicasets
    }
}

#[async_trait]
impl TopologyProvider for StaticProvider {
    fn validate(&self) -> Result<()> {
        if self.replicasets.is_empty() {
            return Err(Error::Config("topology is empty".into()));
        }
        for (info, instances) in &self.replicasets {
            validate_replicaset_info(info)?;
            if instances.is_empty() {
                return Err(Error::Config(format!("replicaset {} has no instances", info)));
            }
        }
        Ok(())
    }

    async fn init(&self, controller: &dyn TopologyController) -> Result<()> {
        for (info, instances) in &self.replicasets {
            controller
                .add_replicaset(info.clone(), instances.clone())
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn instances() -> Vec<InstanceInfo> {
        vec![
            InstanceInfo::master("a", "127.0.0.1:3301"),
            InstanceInfo::replica("b", "127.0.0.1:3302"),
        ]
    }

    #[test]
    fn test_empty_topology_rejected() {
        assert!(StaticProvider::new(HashMap::new()).validate().is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut source = HashMap::new();
        source.insert(ReplicasetInfo::new(Uuid::new_v4(), ""), instances());
        assert!(StaticProvider::new(source).validate().is_err());
    }

    #[test]
    fn test_nil_id_rejected() {
        let mut source = HashMap::new();
        source.insert(ReplicasetInfo::new(Uuid::nil(), "rs_1"), instances());
        assert!(StaticProvider::new(source).validate().is_err());
    }

    #[test]
    fn test_valid_topology() {
        let mut source = HashMap::new();
        source.insert(ReplicasetInfo::new(Uuid::new_v4(), "rs_1"), instances());
        assert!(StaticProvider::new(source).validate().is_ok());
    }
}
