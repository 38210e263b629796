//! Replicaset registry.
//!
//! The registry holds an immutable snapshot of every known replicaset.
//! Readers load the current snapshot without locking; writers copy it,
//! apply their change and swap the new snapshot in atomically, so a reader
//! always sees a complete pre- or post-change view.
//!
//! ```text
//!   readers ──load()──► Arc<HashMap<ReplicasetId, Arc<Replicaset>>>
//!                                 ▲
//!   add/remove ──copy, mutate, store()
//! ```

pub mod provider;
pub mod replicaset;

pub use provider::{validate_replicaset_info, StaticProvider, TopologyController, TopologyProvider};
pub use replicaset::{AsyncCall, BucketStatInfo, Replicaset};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::ReplicasetId;

/// Immutable view of the topology.
pub type TopologySnapshot = Arc<HashMap<ReplicasetId, Arc<Replicaset>>>;

/// Copy-on-write registry of replicasets.
#[derive(Debug)]
pub struct TopologyRegistry {
    current: ArcSwap<HashMap<ReplicasetId, Arc<Replicaset>>>,
    /// Serialises writers so no update is lost between copy and store.
    write_lock: Mutex<()>,
}

impl TopologyRegistry {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Current topology. Never blocks.
    pub fn snapshot(&self) -> TopologySnapshot {
        self.current.load_full()
    }

    pub fn get(&self, id: &ReplicasetId) -> Option<Arc<Replicaset>> {
        self.current.load().get(id).cloned()
    }

    pub fn contains(&self, id: &ReplicasetId) -> bool {
        self.current.load().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    /// Register a replicaset. Fails if the id is already known.
    pub fn add(&self, replicaset: Arc<Replicaset>) -> Result<()> {
        let _guard = self.write_lock.lock();
        let current = self.current.load();
        if current.contains_key(&replicaset.id()) {
            return Err(Error::ReplicasetAlreadyExists(replicaset.id()));
        }

        let mut next = HashMap::clone(&current);
        next.insert(replicaset.id(), replicaset);
        self.current.store(Arc::new(next));
        Ok(())
    }

    /// Unregister a replicaset and close its connection.
    ///
    /// The replicaset leaves the snapshot even if closing fails; teardown
    /// errors are returned to the caller.
    pub async fn remove(&self, id: ReplicasetId) -> Vec<Error> {
        let removed = {
            let _guard = self.write_lock.lock();
            let current = self.current.load();
            if !current.contains_key(&id) {
                None
            } else {
                let mut next = HashMap::clone(&current);
                let removed = next.remove(&id);
                self.current.store(Arc::new(next));
                removed
            }
        };

        let Some(replicaset) = removed else {
            return vec![Error::ReplicasetNotFound(id)];
        };

        let mut errors = Vec::new();
        if let Err(e) = replicaset.close().await {
            tracing::warn!(replicaset = %replicaset.info(), error = %e, "Failed to close replicaset connection");
            errors.push(e);
        }
        errors
    }

    /// Remove every replicaset, closing their connections.
    pub async fn clear(&self) -> Vec<Error> {
        let old = {
            let _guard = self.write_lock.lock();
            self.current.swap(Arc::new(HashMap::new()))
        };

        let mut errors = Vec::new();
        for replicaset in old.values() {
            if let Err(e) = replicaset.close().await {
                errors.push(e);
            }
        }
        errors
    }
}

impl Default for TopologyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnection;
    use crate::types::{InstanceInfo, ReplicasetInfo};
    use uuid::Uuid;

    fn replicaset(name: &str) -> Arc<Replicaset> {
        Arc::new(Replicaset::new(
            ReplicasetInfo::new(Uuid::new_v4(), name),
            vec![InstanceInfo::master(format!("{}_a", name), "mock://")],
            MockConnection::new(),
        ))
    }

    #[test]
    fn test_add_and_snapshot() {
        let registry = TopologyRegistry::new();
        let rs1 = replicaset("rs_1");
        let rs2 = replicaset("rs_2");

        registry.add(rs1.clone()).unwrap();
        let before = registry.snapshot();
        registry.add(rs2.clone()).unwrap();

        // Old snapshot is untouched by later writes.
        assert_eq!(before.len(), 1);
        assert_eq!(registry.snapshot().len(), 2);
        assert!(registry.contains(&rs2.id()));
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let registry = TopologyRegistry::new();
        let rs = replicaset("rs_1");

        registry.add(rs.clone()).unwrap();
        assert!(matches!(
            registry.add(rs),
            Err(Error::ReplicasetAlreadyExists(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = TopologyRegistry::new();
        let rs = replicaset("rs_1");
        registry.add(rs.clone()).unwrap();

        let errors = registry.remove(rs.id()).await;
        assert!(errors.is_empty());
        assert!(registry.is_empty());

        let errors = registry.remove(rs.id()).await;
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Error::ReplicasetNotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_collects_close_errors() {
        let registry = TopologyRegistry::new();
        let conn = MockConnection::new();
        conn.fail_close();
        let rs = Arc::new(Replicaset::new(
            ReplicasetInfo::new(Uuid::new_v4(), "rs_1"),
            vec![InstanceInfo::master("rs_1_a", "mock://")],
            conn,
        ));
        registry.add(rs.clone()).unwrap();

        let errors = registry.remove(rs.id()).await;
        assert_eq!(errors.len(), 1);
        assert!(!registry.contains(&rs.id()), "removal is not undone by close errors");
    }

    #[test]
    fn test_concurrent_readers_see_whole_snapshots() {
        let registry = Arc::new(TopologyRegistry::new());
        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    registry.add(replicaset(&format!("rs_{}", i))).unwrap();
                }
            })
        };

        let mut last = 0;
        while last < 200 {
            let snap = registry.snapshot();
            assert!(snap.len() >= last, "snapshots never go backwards");
            last = snap.len();
        }
        writer.join().unwrap();
    }
}
