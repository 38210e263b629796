//! A replicaset and the storage-side calls the router makes against it.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::{Error, NetworkError, OwnershipError, Result, StorageCallError};
use crate::network::ReplicasetConnection;
use crate::types::{
    BucketId, InstanceInfo, PoolMode, ReplicasetCallOpts, ReplicasetId, ReplicasetInfo, Value,
};

const BUCKET_STAT_FN: &str = "vshard.storage.bucket_stat";
const BUCKETS_COUNT_FN: &str = "vshard.storage.buckets_count";
const BUCKETS_DISCOVERY_FN: &str = "vshard.storage.buckets_discovery";

/// Bucket state as reported by `vshard.storage.bucket_stat`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BucketStatInfo {
    #[serde(rename = "id")]
    pub bucket_id: BucketId,
    pub status: String,
}

#[derive(Debug, Default, Deserialize)]
struct BucketsDiscoveryPage {
    #[serde(default)]
    buckets: Vec<BucketId>,
    #[serde(default)]
    next_from: Option<BucketId>,
}

/// A group of instances serving the same set of buckets.
pub struct Replicaset {
    info: ReplicasetInfo,
    instances: Vec<InstanceInfo>,
    conn: Arc<dyn ReplicasetConnection>,
}

impl fmt::Debug for Replicaset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replicaset")
            .field("info", &self.info)
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl Replicaset {
    pub fn new(
        info: ReplicasetInfo,
        instances: Vec<InstanceInfo>,
        conn: Arc<dyn ReplicasetConnection>,
    ) -> Self {
        Self {
            info,
            instances,
            conn,
        }
    }

    pub fn id(&self) -> ReplicasetId {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &ReplicasetInfo {
        &self.info
    }

    pub fn instances(&self) -> &[InstanceInfo] {
        &self.instances
    }

    /// Call `function` and wait for the raw response values.
    ///
    /// The call is bounded by `opts.timeout` when set.
    pub async fn call(
        &self,
        opts: ReplicasetCallOpts,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let fut = self.conn.call(function, args, opts.pool_mode);
        let result = match opts.timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| NetworkError::Timeout)?,
            None => fut.await,
        };
        Ok(result?)
    }

    /// Call `function` until `deadline`.
    pub(crate) async fn call_until(
        &self,
        deadline: tokio::time::Instant,
        pool_mode: PoolMode,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let result = tokio::time::timeout_at(deadline, self.conn.call(function, args, pool_mode))
            .await
            .map_err(|_| NetworkError::Timeout)?;
        Ok(result?)
    }

    /// Start a call in the background and return a handle to its result.
    pub fn call_async(
        self: &Arc<Self>,
        opts: ReplicasetCallOpts,
        function: impl Into<String>,
        args: Vec<Value>,
    ) -> AsyncCall {
        let rs = Arc::clone(self);
        let function = function.into();
        let handle = tokio::spawn(async move { rs.call(opts, &function, args).await });
        AsyncCall { handle }
    }

    /// Number of buckets the replicaset currently stores.
    pub async fn buckets_count(&self, timeout: Option<Duration>) -> Result<u64> {
        let opts = ReplicasetCallOpts {
            pool_mode: PoolMode::Any,
            timeout,
        };
        let data = self.call(opts, BUCKETS_COUNT_FN, Vec::new()).await?;
        let first = data
            .into_iter()
            .next()
            .ok_or_else(|| Error::ProtocolViolation("buckets_count: empty response".into()))?;
        Ok(serde_json::from_value(first)?)
    }

    /// Ask the replicaset whether it stores `bucket_id`.
    pub async fn bucket_stat(
        &self,
        bucket_id: BucketId,
        timeout: Option<Duration>,
    ) -> Result<BucketStatInfo> {
        let opts = ReplicasetCallOpts {
            pool_mode: PoolMode::Any,
            timeout,
        };
        let data = self.call(opts, BUCKET_STAT_FN, vec![json!(bucket_id)]).await?;

        match data.as_slice() {
            [] => Err(Error::ProtocolViolation("bucket_stat: empty response".into())),
            [Value::Null, err] => {
                let err = OwnershipError::decode(err)?;
                Err(StorageCallError::Ownership(err).into())
            }
            [Value::Null, ..] => Err(Error::ProtocolViolation(format!(
                "bucket_stat: unexpected response length when first value is null: {}",
                data.len()
            ))),
            [stat, ..] => Ok(BucketStatInfo::deserialize(stat)?),
        }
    }

    /// List every bucket the replicaset stores, following pagination.
    pub async fn buckets_discovery(&self, timeout: Option<Duration>) -> Result<Vec<BucketId>> {
        let opts = ReplicasetCallOpts {
            pool_mode: PoolMode::Any,
            timeout,
        };
        let mut buckets = Vec::new();
        let mut from: BucketId = 1;

        loop {
            let data = self
                .call(opts, BUCKETS_DISCOVERY_FN, vec![json!({ "from": from })])
                .await?;
            let first = data.into_iter().next().ok_or_else(|| {
                Error::ProtocolViolation("buckets_discovery: empty response".into())
            })?;
            let page: BucketsDiscoveryPage = serde_json::from_value(first)?;
            buckets.extend(page.buckets);

            match page.next_from {
                Some(next) if next > from => from = next,
                Some(next) if next != 0 => {
                    return Err(Error::ProtocolViolation(format!(
                        "buckets_discovery: next_from {} does not advance past {}",
                        next, from
                    )))
                }
                _ => break,
            }
        }

        Ok(buckets)
    }

    /// Close the underlying connection.
    pub(crate) async fn close(&self) -> Result<()> {
        Ok(self.conn.close().await?)
    }
}

/// Handle to a call started with [`Replicaset::call_async`].
#[derive(Debug)]
pub struct AsyncCall {
    handle: JoinHandle<Result<Vec<Value>>>,
}

impl AsyncCall {
    /// Wait for the raw response values.
    pub async fn get(self) -> Result<Vec<Value>> {
        self.handle
            .await
            .map_err(|e| Error::Internal(format!("call task failed: {}", e)))?
    }

    /// Wait for the response and decode the whole value list into `T`.
    pub async fn get_typed<T: DeserializeOwned>(self) -> Result<T> {
        let data = self.get().await?;
        Ok(serde_json::from_value(Value::Array(data))?)
    }

    /// Cancel the call.
    pub fn abort(&self) {
        self.handle.abort();
    }
}
