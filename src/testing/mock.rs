//! In-memory replicaset connections.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, NetworkError, Result};
use crate::network::{Connector, ReplicasetConnection};
use crate::types::{BucketId, Credentials, InstanceInfo, PoolMode, ReplicasetId, ReplicasetInfo, Value};

type CallResult = std::result::Result<Vec<Value>, NetworkError>;
type Handler = Arc<dyn Fn(Vec<Value>) -> CallResult + Send + Sync>;

/// Connection answering each function with a scripted handler.
///
/// Calls to functions without a handler fail with a remote error.
pub struct MockConnection {
    handlers: RwLock<HashMap<String, (Handler, Duration)>>,
    calls: Mutex<HashMap<String, usize>>,
    fail_close: AtomicBool,
    closed: AtomicBool,
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("handlers", &self.handlers.read().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            fail_close: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Answer `function` with `handler`.
    pub fn on<F>(&self, function: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> CallResult + Send + Sync + 'static,
    {
        self.on_delayed(function, Duration::ZERO, handler);
    }

    /// Answer `function` with `handler` after `delay`.
    pub fn on_delayed<F>(&self, function: &str, delay: Duration, handler: F)
    where
        F: Fn(Vec<Value>) -> CallResult + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .insert(function.to_string(), (Arc::new(handler), delay));
    }

    /// Number of calls made to `function`.
    pub fn calls(&self, function: &str) -> usize {
        self.calls.lock().get(function).copied().unwrap_or(0)
    }

    /// Make `close` fail.
    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ReplicasetConnection for MockConnection {
    async fn call(&self, function: &str, args: Vec<Value>, _pool_mode: PoolMode) -> CallResult {
        *self.calls.lock().entry(function.to_string()).or_insert(0) += 1;

        let handler = self.handlers.read().get(function).cloned();
        let Some((handler, delay)) = handler else {
            return Err(NetworkError::Remote(format!(
                "Procedure '{}' is not defined",
                function
            )));
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        handler(args)
    }

    async fn close(&self) -> std::result::Result<(), NetworkError> {
        self.closed.store(true, Ordering::Relaxed);
        if self.fail_close.load(Ordering::Relaxed) {
            return Err(NetworkError::ConnectionClosed);
        }
        Ok(())
    }
}

/// Storage function run by [`MockStorage`]. `Err` is raised as an assert
/// error.
pub type StorageFn = Arc<dyn Fn(Vec<Value>) -> std::result::Result<Vec<Value>, String> + Send + Sync>;

/// Buckets returned per `buckets_discovery` page.
pub const DISCOVERY_PAGE_SIZE: usize = 1000;

/// Simulated storage node speaking the router's storage protocol.
///
/// It owns a set of buckets, answers `vshard.storage.call` for them with
/// `WRONG_BUCKET` for the rest, and implements `bucket_stat`,
/// `buckets_count`, `buckets_discovery` and the `storage_ref` /
/// `storage_map` / `storage_unref` service calls.
pub struct MockStorage {
    buckets: RwLock<BTreeSet<BucketId>>,
    functions: RwLock<HashMap<String, StorageFn>>,
    /// Calls per function, with `_call` split by service name.
    calls: Mutex<HashMap<String, usize>>,
    refs: Mutex<BTreeSet<u64>>,
    latency_ms: AtomicU64,
    unref_latency_ms: AtomicU64,
    ref_count_override: Mutex<Option<u64>>,
    unavailable: AtomicBool,
    fail_ref: AtomicBool,
    fail_discovery: AtomicBool,
}

impl fmt::Debug for MockStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockStorage")
            .field("buckets", &self.buckets.read().len())
            .field("refs", &self.refs.lock().len())
            .finish()
    }
}

impl MockStorage {
    pub fn new(buckets: impl IntoIterator<Item = BucketId>) -> Arc<Self> {
        Arc::new(Self {
            buckets: RwLock::new(buckets.into_iter().collect()),
            functions: RwLock::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            refs: Mutex::new(BTreeSet::new()),
            latency_ms: AtomicU64::new(0),
            unref_latency_ms: AtomicU64::new(0),
            ref_count_override: Mutex::new(None),
            unavailable: AtomicBool::new(false),
            fail_ref: AtomicBool::new(false),
            fail_discovery: AtomicBool::new(false),
        })
    }

    /// Register a storage function.
    pub fn register<F>(&self, name: &str, function: F)
    where
        F: Fn(Vec<Value>) -> std::result::Result<Vec<Value>, String> + Send + Sync + 'static,
    {
        self.functions
            .write()
            .insert(name.to_string(), Arc::new(function));
    }

    pub fn owns(&self, bucket_id: BucketId) -> bool {
        self.buckets.read().contains(&bucket_id)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn add_bucket(&self, bucket_id: BucketId) {
        self.buckets.write().insert(bucket_id);
    }

    pub fn remove_bucket(&self, bucket_id: BucketId) -> bool {
        self.buckets.write().remove(&bucket_id)
    }

    /// Move `bucket_id` from this storage to `to`.
    pub fn move_bucket(&self, bucket_id: BucketId, to: &MockStorage) {
        if self.remove_bucket(bucket_id) {
            to.add_bucket(bucket_id);
        }
    }

    /// Delay applied to storage function runs (`call` and `storage_map`).
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Delay applied to `storage_unref` before the ref is dropped.
    pub fn set_unref_latency(&self, latency: Duration) {
        self.unref_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Report `count` from `storage_ref` instead of the real bucket count.
    pub fn set_ref_count(&self, count: Option<u64>) {
        *self.ref_count_override.lock() = count;
    }

    /// Fail every call at the transport level.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Answer `storage_ref` with an error.
    pub fn set_fail_ref(&self, fail: bool) {
        self.fail_ref.store(fail, Ordering::Relaxed);
    }

    /// Fail `buckets_discovery` at the transport level.
    pub fn set_fail_discovery(&self, fail: bool) {
        self.fail_discovery.store(fail, Ordering::Relaxed);
    }

    /// Number of calls to `function`; service calls are counted by their
    /// service name (`storage_ref`, `storage_map`, `storage_unref`).
    pub fn calls(&self, function: &str) -> usize {
        self.calls.lock().get(function).copied().unwrap_or(0)
    }

    /// Refs currently held.
    pub fn active_refs(&self) -> usize {
        self.refs.lock().len()
    }

    fn record(&self, function: &str) {
        *self.calls.lock().entry(function.to_string()).or_insert(0) += 1;
    }

    async fn run_function(&self, name: &str, args: Value) -> Vec<Value> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let args = match args {
            Value::Array(args) => args,
            Value::Null => Vec::new(),
            other => vec![other],
        };

        let function = self.functions.read().get(name).cloned();
        let result = match function {
            Some(function) => function(args),
            None => Err(format!("Procedure '{}' is not defined", name)),
        };

        match result {
            Ok(mut values) => {
                values.insert(0, json!(true));
                values
            }
            Err(message) => vec![json!(false), assert_error(&message)],
        }
    }

    async fn storage_call(&self, args: Vec<Value>) -> CallResult {
        let mut args = args.into_iter();
        let bucket_id = args.next().and_then(|v| v.as_u64()).unwrap_or(0);
        let _mode = args.next();
        let function = args
            .next()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let fn_args = args.next().unwrap_or(Value::Null);

        if !self.owns(bucket_id) {
            return Ok(vec![Value::Null, wrong_bucket(bucket_id)]);
        }
        self.record(&function);
        Ok(self.run_function(&function, fn_args).await)
    }

    async fn service_call(&self, args: Vec<Value>) -> CallResult {
        let mut args = args.into_iter();
        let service = args
            .next()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let ref_id = args.next().and_then(|v| v.as_u64()).unwrap_or(0);
        self.record(&service);

        match service.as_str() {
            "storage_ref" => {
                if self.fail_ref.load(Ordering::Relaxed) {
                    return Ok(vec![
                        Value::Null,
                        json!({"type": "ShardingError", "message": "Timeout exceeded", "code": 12}),
                    ]);
                }
                self.refs.lock().insert(ref_id);
                let count = self
                    .ref_count_override
                    .lock()
                    .unwrap_or(self.bucket_count() as u64);
                Ok(vec![json!(count)])
            }
            "storage_map" => {
                if !self.refs.lock().contains(&ref_id) {
                    return Ok(vec![
                        Value::Null,
                        json!({"type": "ShardingError", "message": format!("Can not use a storage with an unknown ref {}", ref_id), "code": 34}),
                    ]);
                }
                let function = args
                    .next()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                let fn_args = args.next().unwrap_or(Value::Null);
                self.record(&function);

                let mut response = self.run_function(&function, fn_args).await;
                if response.first() == Some(&json!(false)) {
                    response[0] = Value::Null;
                }
                Ok(response)
            }
            "storage_unref" => {
                let latency = self.unref_latency_ms.load(Ordering::Relaxed);
                if latency > 0 {
                    tokio::time::sleep(Duration::from_millis(latency)).await;
                }
                self.refs.lock().remove(&ref_id);
                Ok(vec![json!(true)])
            }
            other => Err(NetworkError::Remote(format!("unknown service call {}", other))),
        }
    }

    fn buckets_discovery(&self, args: Vec<Value>) -> CallResult {
        if self.fail_discovery.load(Ordering::Relaxed) {
            return Err(NetworkError::ConnectionClosed);
        }

        let from = args
            .first()
            .and_then(|v| v.get("from"))
            .and_then(|v| v.as_u64())
            .unwrap_or(1);
        let page: Vec<BucketId> = self
            .buckets
            .read()
            .range(from..)
            .take(DISCOVERY_PAGE_SIZE + 1)
            .copied()
            .collect();

        if page.len() > DISCOVERY_PAGE_SIZE {
            let next_from = page[DISCOVERY_PAGE_SIZE];
            Ok(vec![json!({
                "buckets": &page[..DISCOVERY_PAGE_SIZE],
                "next_from": next_from,
            })])
        } else {
            Ok(vec![json!({ "buckets": page })])
        }
    }
}

#[async_trait]
impl ReplicasetConnection for MockStorage {
    async fn call(&self, function: &str, args: Vec<Value>, _pool_mode: PoolMode) -> CallResult {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(NetworkError::ConnectionFailed {
                addr: "mock".into(),
                reason: "storage is unavailable".into(),
            });
        }

        match function {
            "vshard.storage.call" => self.storage_call(args).await,
            "vshard.storage._call" => self.service_call(args).await,
            "vshard.storage.bucket_stat" => {
                self.record(function);
                let bucket_id = args.first().and_then(|v| v.as_u64()).unwrap_or(0);
                if self.owns(bucket_id) {
                    Ok(vec![json!({"id": bucket_id, "status": "active"})])
                } else {
                    Ok(vec![Value::Null, wrong_bucket(bucket_id)])
                }
            }
            "vshard.storage.buckets_count" => {
                self.record(function);
                Ok(vec![json!(self.bucket_count())])
            }
            "vshard.storage.buckets_discovery" => {
                self.record(function);
                self.buckets_discovery(args)
            }
            other => Err(NetworkError::Remote(format!(
                "Procedure '{}' is not defined",
                other
            ))),
        }
    }

    async fn close(&self) -> std::result::Result<(), NetworkError> {
        Ok(())
    }
}

fn wrong_bucket(bucket_id: BucketId) -> Value {
    json!({
        "bucket_id": bucket_id,
        "reason": "Not found",
        "code": 1,
        "type": "ShardingError",
        "message": format!("Cannot perform action with bucket {}, reason: Not found", bucket_id),
        "name": "WRONG_BUCKET",
    })
}

fn assert_error(message: &str) -> Value {
    json!({
        "code": 32,
        "base_type": "ClientError",
        "type": "ClientError",
        "message": message,
        "trace": [{"file": "storage.lua", "line": 1}],
    })
}

/// Connector handing out pre-registered connections by replicaset id.
#[derive(Default)]
pub struct MockConnector {
    connections: RwLock<HashMap<ReplicasetId, Arc<dyn ReplicasetConnection>>>,
    connects: AtomicU64,
}

impl fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnector")
            .field("connections", &self.connections.read().len())
            .finish()
    }
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: ReplicasetId, conn: Arc<dyn ReplicasetConnection>) {
        self.connections.write().insert(id, conn);
    }

    /// Number of successful `connect` calls.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        info: &ReplicasetInfo,
        _instances: &[InstanceInfo],
        _credentials: &Credentials,
    ) -> Result<Arc<dyn ReplicasetConnection>> {
        let conn = self.connections.read().get(&info.id).cloned();
        match conn {
            Some(conn) => {
                self.connects.fetch_add(1, Ordering::Relaxed);
                Ok(conn)
            }
            None => Err(Error::Network(NetworkError::ConnectionFailed {
                addr: info.to_string(),
                reason: "no mock connection registered".into(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_storage_call_on_owned_bucket() {
        let storage = MockStorage::new([1, 2]);
        storage.register("echo", |args| Ok(args));

        let resp = storage
            .call(
                "vshard.storage.call",
                vec![json!(1), json!("read"), json!("echo"), json!(["a"])],
                PoolMode::Any,
            )
            .await
            .unwrap();
        assert_eq!(resp, vec![json!(true), json!("a")]);
        assert_eq!(storage.calls("echo"), 1);

        let resp = storage
            .call(
                "vshard.storage.call",
                vec![json!(3), json!("read"), json!("echo"), json!([])],
                PoolMode::Any,
            )
            .await
            .unwrap();
        assert_eq!(resp[0], Value::Null);
        assert_eq!(resp[1]["name"], "WRONG_BUCKET");
    }

    #[tokio::test]
    async fn test_ref_map_unref_cycle() {
        let storage = MockStorage::new(1..=10);
        storage.register("count", |_| Ok(vec![json!(10)]));

        let resp = storage
            .call("vshard.storage._call", vec![json!("storage_ref"), json!(7), json!(0.5)], PoolMode::Rw)
            .await
            .unwrap();
        assert_eq!(resp, vec![json!(10)]);
        assert_eq!(storage.active_refs(), 1);

        let resp = storage
            .call(
                "vshard.storage._call",
                vec![json!("storage_map"), json!(7), json!("count"), json!([])],
                PoolMode::Rw,
            )
            .await
            .unwrap();
        assert_eq!(resp, vec![json!(true), json!(10)]);

        storage
            .call("vshard.storage._call", vec![json!("storage_unref"), json!(7)], PoolMode::Rw)
            .await
            .unwrap();
        assert_eq!(storage.active_refs(), 0);
        assert_eq!(storage.calls("storage_unref"), 1);
    }

    #[tokio::test]
    async fn test_discovery_pages() {
        let storage = MockStorage::new(1..=(DISCOVERY_PAGE_SIZE as u64 + 5));
        let resp = storage
            .call("vshard.storage.buckets_discovery", vec![json!({"from": 1})], PoolMode::Any)
            .await
            .unwrap();
        assert_eq!(resp[0]["buckets"].as_array().unwrap().len(), DISCOVERY_PAGE_SIZE);
        assert_eq!(resp[0]["next_from"], json!(DISCOVERY_PAGE_SIZE + 1));
    }

    #[tokio::test]
    async fn test_connector_unknown_replicaset() {
        let connector = MockConnector::new();
        let info = ReplicasetInfo::new(uuid::Uuid::new_v4(), "rs");
        let result = connector.connect(&info, &[], &Credentials::default()).await;
        assert!(result.is_err());
        assert_eq!(connector.connects(), 0);
    }
}
