//! Reference TCP transport.
//!
//! Opens one connection per call, writes a framed [`RpcRequest`] and waits
//! for the matching [`RpcResponse`]. Good enough for tests and small
//! deployments; production setups plug in a pooled [`Connector`].

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use super::connection::{select_instance, Connector, ReplicasetConnection};
use super::rpc::{read_frame, write_frame, RpcRequest, RpcResponse};
use crate::error::{Error, NetworkError, Result};
use crate::types::{Credentials, InstanceInfo, PoolMode, ReplicasetInfo, Value};

/// Configuration for the TCP transport.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// Creates [`TcpReplicasetConnection`]s.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TcpConfig,
}

impl TcpConnector {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        info: &ReplicasetInfo,
        instances: &[InstanceInfo],
        credentials: &Credentials,
    ) -> Result<Arc<dyn ReplicasetConnection>> {
        if instances.is_empty() {
            return Err(Error::Config(format!("replicaset {} has no instances", info)));
        }

        Ok(Arc::new(TcpReplicasetConnection {
            instances: instances.to_vec(),
            credentials: credentials.clone(),
            config: self.config.clone(),
            next_request_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Connection to the instances of one replicaset over TCP.
#[derive(Debug)]
pub struct TcpReplicasetConnection {
    instances: Vec<InstanceInfo>,
    credentials: Credentials,
    config: TcpConfig,
    next_request_id: AtomicU64,
    closed: AtomicBool,
}

impl TcpReplicasetConnection {
    async fn roundtrip(&self, addr: &str, request: &RpcRequest) -> std::result::Result<Vec<Value>, NetworkError> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: "connect timeout".into(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        let (mut reader, mut writer) = stream.into_split();
        write_frame(&mut writer, request).await?;

        let response: RpcResponse = read_frame(&mut reader)
            .await?
            .ok_or(NetworkError::ConnectionClosed)?;

        if response.request_id != request.request_id {
            return Err(NetworkError::ReceiveFailed(format!(
                "response id {} does not match request id {}",
                response.request_id, request.request_id
            )));
        }

        response.into_result()
    }
}

#[async_trait]
impl ReplicasetConnection for TcpReplicasetConnection {
    async fn call(
        &self,
        function: &str,
        args: Vec<Value>,
        pool_mode: PoolMode,
    ) -> std::result::Result<Vec<Value>, NetworkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::ConnectionClosed);
        }

        let instance = select_instance(&self.instances, pool_mode)?;
        let request = RpcRequest {
            request_id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            user: self.credentials.user.clone(),
            password: self.credentials.password.clone(),
            function: function.to_string(),
            args,
        };

        tracing::trace!(
            instance = %instance.name,
            addr = %instance.addr,
            function,
            request_id = request.request_id,
            "Sending request"
        );

        self.roundtrip(&instance.addr, &request).await
    }

    async fn close(&self) -> std::result::Result<(), NetworkError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
