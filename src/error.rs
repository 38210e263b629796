//! Error types for the bucket router.

use crate::types::{BucketId, ReplicasetId, Value};
use serde::Deserialize;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for router operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the router.
#[derive(Error, Debug)]
pub enum Error {
    /// Bucket id outside `[1, total]`. Never retried.
    #[error("bucket id is out of range: {bucket_id} (total {total})")]
    BucketOutOfRange { bucket_id: BucketId, total: u64 },

    /// No replicaset could be found for the bucket.
    #[error("cannot resolve bucket {bucket_id}: {reason}")]
    BucketResolve { bucket_id: BucketId, reason: String },

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Storage node answered with a response of the wrong shape.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Storage node reported an error for a bucket call.
    #[error(transparent)]
    Storage(#[from] StorageCallError),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Ref phase saw a bucket count different from the configured total.
    #[error("total bucket count got {got}, expected {expected}")]
    BucketCountMismatch { got: u64, expected: u64 },

    /// Ref phase failed on a replicaset.
    #[error("storage_ref failed on replicaset {replicaset}: {reason}")]
    RefFailed {
        replicaset: ReplicasetId,
        reason: String,
    },

    /// Map phase failed on a replicaset.
    #[error("storage_map failed on replicaset {replicaset}: {reason}")]
    MapFailed {
        replicaset: ReplicasetId,
        reason: String,
    },

    /// Replicaset not found in the topology.
    #[error("replicaset not found: {0}")]
    ReplicasetNotFound(ReplicasetId),

    /// Replicaset already present in the topology.
    #[error("replicaset already exists: {0}")]
    ReplicasetAlreadyExists(ReplicasetId),

    /// Configuration or topology validation errors.
    #[error("config error: {0}")]
    Config(String),

    /// A payload could not be decoded into the requested type.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error signals that the bucket changed owner and the
    /// cached resolution must be dropped.
    pub fn is_bucket_migration(&self) -> bool {
        matches!(self, Error::Storage(StorageCallError::Ownership(e)) if e.kind.is_migration())
    }

    /// Whether the call router gives up immediately on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::BucketOutOfRange { .. })
    }
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// No instance in the replicaset matches the pool mode.
    #[error("no instance available for pool mode {0}")]
    NoInstance(String),

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The remote side rejected or failed the request.
    #[error("remote error: {0}")]
    Remote(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The call did not complete within its timeout.
    #[error("request timed out")]
    Timeout,

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors reported by `vshard.storage.call`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageCallError {
    /// The storage refused the bucket (`[null, err]`).
    #[error("{0}")]
    Ownership(OwnershipError),

    /// The user function raised (`[false, err]`).
    #[error("{0}")]
    Assert(AssertError),
}

/// Classification of an ownership error, decided once at decode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipErrorKind {
    /// Bucket is not on this replicaset.
    WrongBucket,
    /// Bucket is locked by a rebalance.
    BucketIsLocked,
    /// Bucket is being sent or received.
    TransferIsInProgress,
    /// Any other named error.
    Other(String),
}

impl OwnershipErrorKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "WRONG_BUCKET" => OwnershipErrorKind::WrongBucket,
            "BUCKET_IS_LOCKED" => OwnershipErrorKind::BucketIsLocked,
            "TRANSFER_IS_IN_PROGRESS" => OwnershipErrorKind::TransferIsInProgress,
            other => OwnershipErrorKind::Other(other.to_string()),
        }
    }

    /// Moved, locked or mid-transfer.
    pub fn is_migration(&self) -> bool {
        !matches!(self, OwnershipErrorKind::Other(_))
    }
}

impl fmt::Display for OwnershipErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnershipErrorKind::WrongBucket => f.write_str("WRONG_BUCKET"),
            OwnershipErrorKind::BucketIsLocked => f.write_str("BUCKET_IS_LOCKED"),
            OwnershipErrorKind::TransferIsInProgress => f.write_str("TRANSFER_IS_IN_PROGRESS"),
            OwnershipErrorKind::Other(name) => f.write_str(name),
        }
    }
}

/// Wire record of an ownership error.
#[derive(Debug, Clone, Default, Deserialize)]
struct OwnershipErrorRecord {
    #[serde(default)]
    bucket_id: BucketId,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    code: i64,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    master_uuid: Option<String>,
    #[serde(default)]
    replicaset_uuid: Option<String>,
}

/// Ownership error returned by a storage node.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnershipError {
    pub bucket_id: BucketId,
    pub reason: String,
    pub code: i64,
    pub error_type: String,
    pub message: String,
    pub kind: OwnershipErrorKind,
    pub master_id: Option<String>,
    pub replicaset_id: Option<String>,
}

impl OwnershipError {
    /// Decode an ownership error payload.
    pub fn decode(payload: &Value) -> std::result::Result<Self, serde_json::Error> {
        let record = OwnershipErrorRecord::deserialize(payload)?;
        Ok(Self {
            bucket_id: record.bucket_id,
            reason: record.reason,
            code: record.code,
            error_type: record.kind,
            message: record.message,
            kind: OwnershipErrorKind::from_name(&record.name),
            master_id: record.master_uuid,
            replicaset_id: record.replicaset_uuid,
        })
    }
}

impl fmt::Display for OwnershipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vshard.storage.call bucket error bucket_id: {}, reason: {}, name: {}",
            self.bucket_id, self.reason, self.kind
        )
    }
}

/// Error raised by the user function on the storage.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssertError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub base_type: String,
    #[serde(default, rename = "type")]
    pub error_type: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub trace: Value,
}

impl AssertError {
    pub fn decode(payload: &Value) -> std::result::Result<Self, serde_json::Error> {
        Self::deserialize(payload)
    }
}

impl fmt::Display for AssertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vshard.storage.call assert error code: {}, type: {}, message: {}",
            self.code, self.error_type, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ownership_kind_classification() {
        assert!(OwnershipErrorKind::from_name("WRONG_BUCKET").is_migration());
        assert!(OwnershipErrorKind::from_name("BUCKET_IS_LOCKED").is_migration());
        assert!(OwnershipErrorKind::from_name("TRANSFER_IS_IN_PROGRESS").is_migration());

        let other = OwnershipErrorKind::from_name("NON_MASTER");
        assert!(!other.is_migration());
        assert_eq!(other.to_string(), "NON_MASTER");
    }

    #[test]
    fn test_decode_ownership_error() {
        let payload = json!({
            "bucket_id": 42,
            "reason": "bucket moved",
            "code": 1,
            "type": "ShardingError",
            "message": "Cannot perform action with bucket 42",
            "name": "WRONG_BUCKET",
            "replicaset_uuid": "cbf06940-0790-498b-948d-042b62cf3d29",
        });

        let err = OwnershipError::decode(&payload).unwrap();
        assert_eq!(err.bucket_id, 42);
        assert_eq!(err.kind, OwnershipErrorKind::WrongBucket);
        assert_eq!(err.error_type, "ShardingError");
        assert!(err.master_id.is_none());
        assert!(err.replicaset_id.is_some());

        let wrapped = Error::from(StorageCallError::Ownership(err));
        assert!(wrapped.is_bucket_migration());
        assert!(!wrapped.is_fatal());
    }

    #[test]
    fn test_decode_ownership_error_rejects_non_object() {
        assert!(OwnershipError::decode(&json!("boom")).is_err());
    }

    #[test]
    fn test_decode_assert_error() {
        let payload = json!({
            "code": 32,
            "base_type": "LuajitError",
            "type": "LuajitError",
            "message": "assertion failed!",
            "trace": [{"file": "init.lua", "line": 10}],
        });

        let err = AssertError::decode(&payload).unwrap();
        assert_eq!(err.code, 32);
        assert_eq!(err.message, "assertion failed!");
        assert!(err.to_string().contains("assertion failed!"));

        let wrapped = Error::from(StorageCallError::Assert(err));
        assert!(!wrapped.is_bucket_migration());
    }

    #[test]
    fn test_range_error_is_fatal() {
        let err = Error::BucketOutOfRange {
            bucket_id: 0,
            total: 100,
        };
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "bucket id is out of range: 0 (total 100)");
    }
}
