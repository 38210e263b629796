//! Network communication layer.

pub mod connection;
pub mod rpc;
pub mod tcp;

pub use connection::{select_instance, Connector, ReplicasetConnection};
pub use rpc::{RpcRequest, RpcResponse};
pub use tcp::{TcpConfig, TcpConnector};
