//! Core types used throughout the router.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Bucket identifier. Valid buckets are in `[1, total_bucket_count]`.
pub type BucketId = u64;

/// Replicaset identifier.
pub type ReplicasetId = Uuid;

/// Identifier correlating the ref/map/unref calls of one broadcast.
pub type RefId = u64;

/// Dynamic value exchanged with storage nodes.
pub type Value = serde_json::Value;

/// Identity of a replicaset as supplied by the topology provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicasetInfo {
    /// Unique replicaset id (must not be nil).
    pub id: ReplicasetId,
    /// Human-readable name (must not be empty).
    pub name: String,
}

impl ReplicasetInfo {
    /// Create replicaset info.
    pub fn new(id: ReplicasetId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl fmt::Display for ReplicasetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Role of an instance inside its replicaset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum InstanceRole {
    /// Write-eligible instance.
    Master,
    /// Read-only instance.
    #[default]
    Replica,
}

/// A single addressable storage node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Instance name, used in logs.
    pub name: String,
    /// Network address (`host:port`).
    pub addr: String,
    /// Role within the replicaset.
    pub role: InstanceRole,
}

impl InstanceInfo {
    /// Create a write-eligible instance.
    pub fn master(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            role: InstanceRole::Master,
        }
    }

    /// Create a read-only instance.
    pub fn replica(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            role: InstanceRole::Replica,
        }
    }

    /// Whether this instance accepts writes.
    pub fn is_master(&self) -> bool {
        self.role == InstanceRole::Master
    }
}

/// Credentials presented to storage nodes.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Storage-side execution mode of a bucket call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallMode {
    #[default]
    Read,
    Write,
}

impl CallMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallMode::Read => "read",
            CallMode::Write => "write",
        }
    }
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which instance of a replicaset receives a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PoolMode {
    /// Any instance.
    #[default]
    Any,
    /// Read-only instances only.
    Ro,
    /// The write-eligible instance only.
    Rw,
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolMode::Any => write!(f, "any"),
            PoolMode::Ro => write!(f, "ro"),
            PoolMode::Rw => write!(f, "rw"),
        }
    }
}

/// Options for router-level calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOpts {
    /// Storage execution mode.
    pub mode: CallMode,
    /// Instance selection inside the target replicaset.
    pub pool_mode: PoolMode,
    /// Overall call timeout. `None` means [`crate::config::CALL_TIMEOUT_MIN`].
    pub timeout: Option<Duration>,
}

impl CallOpts {
    /// Read call routed to any instance.
    pub fn read() -> Self {
        Self::default()
    }

    /// Write call routed to the master.
    pub fn write() -> Self {
        Self {
            mode: CallMode::Write,
            pool_mode: PoolMode::Rw,
            timeout: None,
        }
    }

    pub fn with_pool_mode(mut self, pool_mode: PoolMode) -> Self {
        self.pool_mode = pool_mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Options for a direct call on one replicaset.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicasetCallOpts {
    pub pool_mode: PoolMode,
    /// Per-call timeout. `None` means the call is bounded only by the transport.
    pub timeout: Option<Duration>,
}

impl ReplicasetCallOpts {
    pub fn new(pool_mode: PoolMode) -> Self {
        Self {
            pool_mode,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Point-in-time view of router state.
#[derive(Debug, Clone, Default)]
pub struct RouterStatus {
    /// Number of replicasets in the topology.
    pub replicasets: usize,
    /// Buckets with a cached owner.
    pub known_buckets: usize,
    /// Configured bucket count.
    pub total_buckets: u64,
}
