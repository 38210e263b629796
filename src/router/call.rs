//! Single-bucket calls.
//!
//! ```text
//!   RESOLVE ──► DISPATCH ──► AWAIT ──┬──► SUCCESS
//!      ▲                             ├──► RETRY ──┐
//!      └─────────────────────────────┼────────────┘
//!                                    └──► TIMEOUT
//! ```
//!
//! The bucket is resolved again on every attempt. Only a range error ends
//! the loop early; everything else is retried until the deadline, and the
//! last observed error is returned when it passes.

use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::time::Instant;

use super::Router;
use crate::config::CALL_TIMEOUT_MIN;
use crate::error::{AssertError, Error, OwnershipError, Result, StorageCallError};
use crate::types::{BucketId, CallOpts, PoolMode, Value};

pub(crate) const STORAGE_CALL_FN: &str = "vshard.storage.call";

/// Successful response of a bucket call.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageCallResult {
    /// Full response, leading `true` included.
    data: Vec<Value>,
}

impl StorageCallResult {
    /// Values returned by the storage function.
    pub fn values(&self) -> &[Value] {
        &self.data[1..]
    }

    pub fn into_values(mut self) -> Vec<Value> {
        self.data.remove(0);
        self.data
    }

    /// Decode the first returned value into `T`.
    ///
    /// Returns `Ok(None)` when the function returned nothing.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.data.get(1) {
            None => Ok(None),
            Some(value) => Ok(Some(T::deserialize(value)?)),
        }
    }
}

impl Router {
    /// Call `function` on the replicaset that owns `bucket_id`.
    ///
    /// Retries on transport failures, bucket moves and storage errors until
    /// `opts.timeout` (or [`CALL_TIMEOUT_MIN`]) has elapsed since the call
    /// started.
    pub async fn call(
        &self,
        bucket_id: BucketId,
        opts: CallOpts,
        function: &str,
        args: Vec<Value>,
    ) -> Result<StorageCallResult> {
        self.inner.cache.check_range(bucket_id)?;

        let timeout = opts
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(CALL_TIMEOUT_MIN);
        let started = Instant::now();
        let deadline = started + timeout;
        let request = vec![
            json!(bucket_id),
            json!(opts.mode.as_str()),
            json!(function),
            Value::Array(args),
        ];

        let mut last_error: Option<Error> = None;
        let mut attempt: u32 = 0;

        loop {
            if Instant::now() >= deadline {
                let elapsed = started.elapsed();
                self.inner.metrics.record_request(elapsed, false, false);
                tracing::debug!(
                    bucket_id,
                    function,
                    attempts = attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Bucket call timed out"
                );
                return Err(last_error.unwrap_or(Error::Timeout));
            }
            attempt += 1;

            match self
                .call_attempt(bucket_id, opts.pool_mode, deadline, function, request.clone())
                .await
            {
                Ok(result) => {
                    self.inner
                        .metrics
                        .record_request(started.elapsed(), true, false);
                    return Ok(result);
                }
                Err(e) if e.is_fatal() => {
                    self.inner
                        .metrics
                        .record_request(started.elapsed(), false, false);
                    return Err(e);
                }
                Err(e) => {
                    if e.is_bucket_migration() {
                        self.inner.cache.invalidate(bucket_id);
                    }
                    self.inner.metrics.record_retry(retry_reason(&e));
                    last_error = Some(e);
                }
            }

            let delay = self.inner.config.retry_policy.delay(attempt);
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep_until(deadline.min(Instant::now() + delay)).await;
            }
        }
    }

    /// Read call on any instance of the owning replicaset.
    pub async fn call_ro(
        &self,
        bucket_id: BucketId,
        function: &str,
        args: Vec<Value>,
    ) -> Result<StorageCallResult> {
        self.call(bucket_id, CallOpts::read(), function, args).await
    }

    /// Write call on the master of the owning replicaset.
    pub async fn call_rw(
        &self,
        bucket_id: BucketId,
        function: &str,
        args: Vec<Value>,
    ) -> Result<StorageCallResult> {
        self.call(bucket_id, CallOpts::write(), function, args).await
    }

    async fn call_attempt(
        &self,
        bucket_id: BucketId,
        pool_mode: PoolMode,
        deadline: Instant,
        function: &str,
        request: Vec<Value>,
    ) -> Result<StorageCallResult> {
        let replicaset = self.resolve_until(bucket_id, deadline).await?;

        tracing::debug!(
            bucket_id,
            function,
            replicaset = %replicaset.info(),
            "Calling storage"
        );

        let data = replicaset
            .call_until(deadline, pool_mode, STORAGE_CALL_FN, request)
            .await
            .map_err(|e| {
                tracing::debug!(bucket_id, replicaset = %replicaset.info(), error = %e, "Storage call failed");
                e
            })?;

        classify_response(bucket_id, data)
    }
}

/// Interpret a `vshard.storage.call` response.
fn classify_response(bucket_id: BucketId, data: Vec<Value>) -> Result<StorageCallResult> {
    match data.first() {
        None => Err(Error::ProtocolViolation(
            "invalid length of response data: must be >= 1, current: 0".into(),
        )),
        Some(Value::Bool(true)) => Ok(StorageCallResult { data }),
        Some(Value::Null) => {
            let payload = data.get(1).ok_or_else(|| {
                Error::ProtocolViolation(format!(
                    "unexpected response length when first value is null: {}",
                    data.len()
                ))
            })?;
            let err = OwnershipError::decode(payload)?;
            if err.kind.is_migration() {
                tracing::debug!(bucket_id, kind = %err.kind, "Bucket moved, dropping cached route");
            } else {
                tracing::warn!(bucket_id, error = %err, "Storage refused bucket call, retrying");
            }
            Err(StorageCallError::Ownership(err).into())
        }
        Some(Value::Bool(false)) => {
            let payload = data.get(1).ok_or_else(|| {
                Error::ProtocolViolation(format!(
                    "unexpected response length when first value is false: {}",
                    data.len()
                ))
            })?;
            let err = AssertError::decode(payload)?;
            tracing::warn!(bucket_id, error = %err, "Storage function raised, retrying");
            Err(StorageCallError::Assert(err).into())
        }
        Some(other) => Err(Error::ProtocolViolation(format!(
            "unexpected first response value: {}",
            other
        ))),
    }
}

/// Metrics label for a retried error.
fn retry_reason(err: &Error) -> &'static str {
    match err {
        Error::BucketResolve { .. } => "bucket_resolve_error",
        Error::Network(_) | Error::Timeout => "future_get_error",
        Error::ProtocolViolation(_) => "resp_data_error",
        Error::Decode(_) => "internal_error",
        e if e.is_bucket_migration() => "bucket_migrate",
        Error::Storage(StorageCallError::Assert(_)) => "assert_error",
        Error::Storage(StorageCallError::Ownership(_)) => "storage_error",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OwnershipErrorKind;
    use serde::Deserialize;

    #[test]
    fn test_success_with_value() {
        let result = classify_response(1, vec![json!(true), json!({"id": 7}), json!("extra")]).unwrap();
        assert_eq!(result.values().len(), 2);

        #[derive(Deserialize, Debug, PartialEq)]
        struct Row {
            id: u64,
        }
        assert_eq!(result.decode::<Row>().unwrap(), Some(Row { id: 7 }));
    }

    #[test]
    fn test_success_without_value_decodes_to_none() {
        let result = classify_response(1, vec![json!(true)]).unwrap();
        assert!(result.values().is_empty());
        assert_eq!(result.decode::<String>().unwrap(), None);
        assert!(result.into_values().is_empty());
    }

    #[test]
    fn test_empty_response_is_protocol_violation() {
        let err = classify_response(1, vec![]).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        assert_eq!(retry_reason(&err), "resp_data_error");
    }

    #[test]
    fn test_ownership_error() {
        let data = vec![
            Value::Null,
            json!({"bucket_id": 3, "reason": "moved", "name": "TRANSFER_IS_IN_PROGRESS"}),
        ];
        let err = classify_response(3, data).unwrap_err();
        assert!(err.is_bucket_migration());
        assert_eq!(retry_reason(&err), "bucket_migrate");

        let data = vec![Value::Null, json!({"bucket_id": 3, "name": "NON_MASTER"})];
        let err = classify_response(3, data).unwrap_err();
        match &err {
            Error::Storage(StorageCallError::Ownership(e)) => {
                assert_eq!(e.kind, OwnershipErrorKind::Other("NON_MASTER".into()))
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(retry_reason(&err), "storage_error");
    }

    #[test]
    fn test_null_without_payload() {
        let err = classify_response(3, vec![Value::Null]).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn test_undecodable_ownership_error() {
        let err = classify_response(3, vec![Value::Null, json!(42)]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert_eq!(retry_reason(&err), "internal_error");
    }

    #[test]
    fn test_assert_error() {
        let data = vec![
            json!(false),
            json!({"code": 32, "type": "ClientError", "message": "boom", "trace": []}),
        ];
        let err = classify_response(3, data).unwrap_err();
        assert!(matches!(err, Error::Storage(StorageCallError::Assert(_))));
        assert_eq!(retry_reason(&err), "assert_error");

        let err = classify_response(3, vec![json!(false)]).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn test_unexpected_first_value() {
        let err = classify_response(3, vec![json!("ok")]).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }
}
