//! Cluster-wide calls with a full bucket coverage check.
//!
//! `map_call_rw` runs in three phases over the topology captured when the
//! call starts:
//!
//! 1. **ref**: every master pins its buckets for `ref_id` and reports how many
//!    it holds; the counts must add up to the configured total.
//! 2. **map**: every master runs the function under the same `ref_id`.
//! 3. **unref**: every master drops the ref. This runs exactly once, whatever
//!    the outcome of the first two phases, including when the caller drops
//!    the future.
//!
//! Phases 1 and 2 share the call deadline. Phase 3 gets a fresh one.

use futures::future::{join_all, try_join_all};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::Router;
use crate::config::CALL_TIMEOUT_MIN;
use crate::error::{AssertError, Error, Result};
use crate::topology::{Replicaset, TopologySnapshot};
use crate::types::{CallOpts, PoolMode, RefId, ReplicasetCallOpts, ReplicasetId, Value};

pub(crate) const STORAGE_SERVICE_FN: &str = "vshard.storage._call";

impl Router {
    /// Run `function` on the master of every replicaset while all buckets
    /// are pinned.
    ///
    /// The result holds one entry per replicaset; `None` when the function
    /// returned nothing there.
    pub async fn map_call_rw(
        &self,
        function: &str,
        args: Vec<Value>,
        opts: CallOpts,
    ) -> Result<HashMap<ReplicasetId, Option<Value>>> {
        let timeout = opts
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(CALL_TIMEOUT_MIN);
        let started = Instant::now();
        let deadline = started + timeout;

        let topology = self.inner.topology.snapshot();
        let ref_id = self.inner.next_ref_id.fetch_add(1, Ordering::Relaxed);
        let guard = RefGuard::new(ref_id, topology.clone(), timeout);

        tracing::debug!(ref_id, function, replicasets = topology.len(), "Starting map_callrw");

        let result = async {
            self.ref_phase(ref_id, &topology, timeout, deadline).await?;
            map_phase(ref_id, &topology, deadline, function, args).await
        }
        .await;

        guard.release().await;

        self.inner
            .metrics
            .record_request(started.elapsed(), result.is_ok(), true);
        if let Err(e) = &result {
            tracing::debug!(ref_id, function, error = %e, "map_callrw failed");
        }
        result
    }

    /// [`Router::map_call_rw`] with every value decoded into `T`.
    pub async fn map_call_rw_typed<T: DeserializeOwned>(
        &self,
        function: &str,
        args: Vec<Value>,
        opts: CallOpts,
    ) -> Result<HashMap<ReplicasetId, Option<T>>> {
        self.map_call_rw(function, args, opts)
            .await?
            .into_iter()
            .map(|(id, value)| -> Result<(ReplicasetId, Option<T>)> {
                let decoded = value.map(serde_json::from_value).transpose()?;
                Ok((id, decoded))
            })
            .collect()
    }

    async fn ref_phase(
        &self,
        ref_id: RefId,
        topology: &TopologySnapshot,
        timeout: Duration,
        deadline: Instant,
    ) -> Result<()> {
        let refs = topology.values().map(|replicaset| async move {
            let args = vec![json!("storage_ref"), json!(ref_id), json!(timeout.as_secs_f64())];
            let data = replicaset
                .call_until(deadline, PoolMode::Rw, STORAGE_SERVICE_FN, args)
                .await
                .map_err(|e| ref_failed(replicaset, e.to_string()))?;
            decode_ref_response(replicaset, data)
        });

        let total: u64 = try_join_all(refs).await?.into_iter().sum();
        let expected = self.inner.cache.total_bucket_count();
        if total != expected {
            tracing::warn!(ref_id, got = total, expected, "Bucket count mismatch in storage_ref");
            return Err(Error::BucketCountMismatch {
                got: total,
                expected,
            });
        }
        Ok(())
    }
}

async fn map_phase(
    ref_id: RefId,
    topology: &TopologySnapshot,
    deadline: Instant,
    function: &str,
    args: Vec<Value>,
) -> Result<HashMap<ReplicasetId, Option<Value>>> {
    let maps = topology.values().map(|replicaset| {
        let args = vec![
            json!("storage_map"),
            json!(ref_id),
            json!(function),
            Value::Array(args.clone()),
        ];
        async move {
            let data = replicaset
                .call_until(deadline, PoolMode::Rw, STORAGE_SERVICE_FN, args)
                .await
                .map_err(|e| map_failed(replicaset, e.to_string()))?;
            let value = decode_map_response(replicaset, data)?;
            Ok::<_, Error>((replicaset.id(), value))
        }
    });

    Ok(try_join_all(maps).await?.into_iter().collect())
}

/// Number of buckets a replicaset pinned, from a `storage_ref` response.
fn decode_ref_response(replicaset: &Replicaset, data: Vec<Value>) -> Result<u64> {
    match data.as_slice() {
        [] => Err(ref_failed(
            replicaset,
            "protocol violation: storage_ref returned no values".into(),
        )),
        [Value::Null, err] => Err(ref_failed(replicaset, err.to_string())),
        [Value::Null, ..] => Err(ref_failed(
            replicaset,
            format!(
                "protocol violation: storage_ref returned {} values with a null status",
                data.len()
            ),
        )),
        [count, ..] => count.as_u64().ok_or_else(|| {
            ref_failed(replicaset, format!("storage_ref returned a non-count value: {}", count))
        }),
    }
}

/// Function result from a `storage_map` response.
fn decode_map_response(replicaset: &Replicaset, data: Vec<Value>) -> Result<Option<Value>> {
    let mut data = data.into_iter();
    match (data.next(), data.next(), data.next()) {
        (Some(Value::Bool(true)), value, None) => Ok(value),
        (Some(Value::Null), Some(err), None) => {
            let reason = match AssertError::decode(&err) {
                Ok(assert) => assert.to_string(),
                Err(_) => err.to_string(),
            };
            Err(map_failed(replicaset, reason))
        }
        (None, ..) => Err(map_failed(
            replicaset,
            "protocol violation: storage_map returned no values".into(),
        )),
        (Some(status), ..) => Err(map_failed(
            replicaset,
            format!("protocol violation: unexpected storage_map response, status {}", status),
        )),
    }
}

fn ref_failed(replicaset: &Replicaset, reason: String) -> Error {
    Error::RefFailed {
        replicaset: replicaset.id(),
        reason,
    }
}

fn map_failed(replicaset: &Replicaset, reason: String) -> Error {
    Error::MapFailed {
        replicaset: replicaset.id(),
        reason,
    }
}

/// Releases a ref on every replicaset of the snapshot it was taken on.
///
/// [`RefGuard::release`] is the normal path. If the guard is dropped
/// before it, the release runs on a spawned task. Either way the unref
/// calls outlive the caller's future.
struct RefGuard {
    ref_id: RefId,
    replicasets: Option<TopologySnapshot>,
    timeout: Duration,
}

impl RefGuard {
    fn new(ref_id: RefId, replicasets: TopologySnapshot, timeout: Duration) -> Self {
        Self {
            ref_id,
            replicasets: Some(replicasets),
            timeout,
        }
    }

    /// Release the ref and wait for it.
    ///
    /// The unref runs on its own task, so dropping the caller mid-release
    /// does not cancel it.
    async fn release(mut self) {
        if let Some(replicasets) = self.replicasets.take() {
            let task = tokio::spawn(unref_all(self.ref_id, replicasets, self.timeout));
            if let Err(e) = task.await {
                tracing::warn!(ref_id = self.ref_id, error = %e, "storage_unref task failed");
            }
        }
    }
}

impl Drop for RefGuard {
    fn drop(&mut self) {
        let Some(replicasets) = self.replicasets.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(ref_id = self.ref_id, "map_callrw cancelled, releasing ref in background");
                handle.spawn(unref_all(self.ref_id, replicasets, self.timeout));
            }
            Err(_) => {
                tracing::warn!(ref_id = self.ref_id, "No runtime to release ref, storages will expire it");
            }
        }
    }
}

async fn unref_all(ref_id: RefId, replicasets: TopologySnapshot, timeout: Duration) {
    let opts = ReplicasetCallOpts::new(PoolMode::Rw).with_timeout(timeout);
    let unrefs = replicasets.values().map(|replicaset| {
        let replicaset: Arc<Replicaset> = Arc::clone(replicaset);
        async move {
            let args = vec![json!("storage_unref"), json!(ref_id)];
            if let Err(e) = replicaset.call(opts, STORAGE_SERVICE_FN, args).await {
                tracing::debug!(ref_id, replicaset = %replicaset.info(), error = %e, "storage_unref failed");
            }
        }
    });
    join_all(unrefs).await;
}
