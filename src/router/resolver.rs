//! Bucket → replicaset resolution.
//!
//! Owners come from the cache when known. Otherwise every replicaset is
//! asked `vshard.storage.bucket_stat` concurrently and the first one that
//! stores the bucket is cached and returned.

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;

use super::Router;
use crate::config::CALL_TIMEOUT_MIN;
use crate::error::{Error, Result};
use crate::topology::{Replicaset, TopologySnapshot};
use crate::types::{BucketId, ReplicasetId};

/// Cached bucket ownership.
///
/// Entries are filled by on-demand resolution and discovery sweeps and
/// dropped when a call learns the bucket moved. A missing entry is never an
/// error: it only means the owner has to be looked up.
#[derive(Debug)]
pub struct BucketCache {
    total_bucket_count: u64,
    routes: DashMap<BucketId, ReplicasetId>,
}

impl BucketCache {
    pub fn new(total_bucket_count: u64) -> Self {
        Self {
            total_bucket_count,
            routes: DashMap::new(),
        }
    }

    pub fn total_bucket_count(&self) -> u64 {
        self.total_bucket_count
    }

    /// Fail unless `bucket_id` is in `[1, total]`.
    pub fn check_range(&self, bucket_id: BucketId) -> Result<()> {
        if bucket_id < 1 || bucket_id > self.total_bucket_count {
            return Err(Error::BucketOutOfRange {
                bucket_id,
                total: self.total_bucket_count,
            });
        }
        Ok(())
    }

    pub fn get(&self, bucket_id: BucketId) -> Option<ReplicasetId> {
        self.routes.get(&bucket_id).map(|entry| *entry.value())
    }

    /// Record `replicaset` as the owner of `bucket_id`.
    pub fn set(&self, bucket_id: BucketId, replicaset: ReplicasetId) -> Result<()> {
        self.check_range(bucket_id)?;
        self.routes.insert(bucket_id, replicaset);
        Ok(())
    }

    /// Forget the owner of `bucket_id`. Idempotent.
    pub fn invalidate(&self, bucket_id: BucketId) {
        self.routes.remove(&bucket_id);
    }

    /// Drop `bucket_id` only if it still points at `replicaset`.
    pub fn invalidate_if(&self, bucket_id: BucketId, replicaset: ReplicasetId) {
        self.routes.remove_if(&bucket_id, |_, owner| *owner == replicaset);
    }

    /// Replace the buckets owned by `replicaset` with `buckets`.
    ///
    /// Reported buckets are pointed at `replicaset`; entries that pointed at
    /// it but were not reported are dropped. Returns how many entries changed.
    pub fn merge_owned(&self, replicaset: ReplicasetId, buckets: &[BucketId]) -> usize {
        let reported: HashSet<BucketId> = buckets
            .iter()
            .copied()
            .filter(|b| self.check_range(*b).is_ok())
            .collect();

        let mut changed = 0;
        for bucket_id in &reported {
            if self.routes.insert(*bucket_id, replicaset) != Some(replicaset) {
                changed += 1;
            }
        }

        self.routes.retain(|bucket_id, owner| {
            let stale = *owner == replicaset && !reported.contains(bucket_id);
            if stale {
                changed += 1;
            }
            !stale
        });

        changed
    }

    /// Drop every entry pointing at `replicaset`.
    pub fn forget_replicaset(&self, replicaset: ReplicasetId) {
        self.routes.retain(|_, owner| *owner != replicaset);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.routes.clear();
    }

    /// Number of buckets with a known owner.
    pub fn known_count(&self) -> usize {
        self.routes.len()
    }

    /// Number of cached buckets pointing at `replicaset`.
    pub fn count_for(&self, replicaset: ReplicasetId) -> usize {
        self.routes
            .iter()
            .filter(|entry| *entry.value() == replicaset)
            .count()
    }
}

impl Router {
    /// Replicaset that owns `bucket_id`.
    pub async fn route(&self, bucket_id: BucketId) -> Result<Arc<Replicaset>> {
        self.resolve_until(bucket_id, Instant::now() + CALL_TIMEOUT_MIN)
            .await
    }

    pub(crate) async fn resolve_until(
        &self,
        bucket_id: BucketId,
        deadline: Instant,
    ) -> Result<Arc<Replicaset>> {
        let cache = &self.inner.cache;
        cache.check_range(bucket_id)?;

        let topology = self.inner.topology.snapshot();
        if let Some(id) = cache.get(bucket_id) {
            match topology.get(&id) {
                Some(replicaset) => return Ok(Arc::clone(replicaset)),
                None => cache.invalidate_if(bucket_id, id),
            }
        }

        let replicaset = lookup_owner(bucket_id, &topology, deadline).await?;
        cache.set(bucket_id, replicaset.id())?;
        self.inner
            .metrics
            .known_buckets
            .set(cache.known_count() as i64);

        tracing::debug!(bucket_id, replicaset = %replicaset.info(), "Resolved bucket");
        Ok(replicaset)
    }
}

/// Ask every replicaset about `bucket_id`; the first owner to answer wins.
async fn lookup_owner(
    bucket_id: BucketId,
    topology: &TopologySnapshot,
    deadline: Instant,
) -> Result<Arc<Replicaset>> {
    if topology.is_empty() {
        return Err(Error::BucketResolve {
            bucket_id,
            reason: "topology is empty".into(),
        });
    }

    let mut lookups: FuturesUnordered<_> = topology
        .values()
        .map(|replicaset| async move {
            let result =
                tokio::time::timeout_at(deadline, replicaset.bucket_stat(bucket_id, None)).await;
            (replicaset, result)
        })
        .collect();

    let mut failures = 0;
    while let Some((replicaset, result)) = lookups.next().await {
        match result {
            Ok(Ok(_)) => return Ok(Arc::clone(replicaset)),
            Ok(Err(e)) if e.is_bucket_migration() => {}
            Ok(Err(e)) => {
                failures += 1;
                tracing::debug!(bucket_id, replicaset = %replicaset.info(), error = %e, "bucket_stat failed");
            }
            Err(_) => {
                failures += 1;
                tracing::debug!(bucket_id, replicaset = %replicaset.info(), "bucket_stat timed out");
            }
        }
    }

    Err(Error::BucketResolve {
        bucket_id,
        reason: format!(
            "no replicaset reported the bucket ({} of {} did not answer)",
            failures,
            topology.len()
        ),
    })
}
