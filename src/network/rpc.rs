//! RPC message types and framing for the reference TCP transport.
//!
//! Every frame is a 4-byte big-endian length followed by a JSON document.

use crate::error::NetworkError;
use crate::types::Value;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from the wire.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A function call sent to a storage instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Unique request ID for correlation.
    pub request_id: u64,

    /// Authenticated user.
    pub user: String,

    /// Password for `user`.
    pub password: String,

    /// Fully qualified function name, e.g. `vshard.storage.call`.
    pub function: String,

    /// Positional arguments.
    pub args: Vec<Value>,
}

/// Response to an [`RpcRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// The request ID this is responding to.
    pub request_id: u64,

    /// Whether the function completed.
    pub success: bool,

    /// Values returned by the function.
    #[serde(default)]
    pub data: Vec<Value>,

    /// Error message if failed.
    pub error: Option<String>,
}

impl RpcResponse {
    /// Create a success response.
    pub fn success(request_id: u64, data: Vec<Value>) -> Self {
        Self {
            request_id,
            success: true,
            data,
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(request_id: u64, error: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            data: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Turn the response into the returned values or a remote error.
    pub fn into_result(self) -> Result<Vec<Value>, NetworkError> {
        if self.success {
            Ok(self.data)
        } else {
            Err(NetworkError::Remote(
                self.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }
}

/// Encode and write one frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data =
        serde_json::to_vec(msg).map_err(|e| NetworkError::Serialization(e.to_string()))?;
    if data.len() > MAX_FRAME_LEN {
        return Err(NetworkError::SendFailed("message too large".into()));
    }

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&(data.len() as u32).to_be_bytes());
    framed.extend_from_slice(&data);

    writer
        .write_all(&framed)
        .await
        .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| NetworkError::SendFailed(e.to_string()))
}

/// Read and decode one frame. Returns `Ok(None)` on a clean EOF.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, NetworkError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetworkError::ReceiveFailed("message too large".into()));
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;

    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| NetworkError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frame_length_prefix() {
        let req = RpcRequest {
            request_id: 7,
            user: "guest".into(),
            password: String::new(),
            function: "echo".into(),
            args: vec![json!(1), json!("two")],
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &req).await.unwrap();

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);

        let mut reader = buf.as_slice();
        let decoded: RpcRequest = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded.request_id, 7);
        assert_eq!(decoded.args, vec![json!(1), json!("two")]);

        let eof: Option<RpcRequest> = read_frame(&mut reader).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(b"{}");

        let mut reader = buf.as_slice();
        let result: Result<Option<RpcResponse>, _> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(NetworkError::ReceiveFailed(_))));
    }

    #[test]
    fn test_response_into_result() {
        let ok = RpcResponse::success(1, vec![json!(true)]);
        assert_eq!(ok.into_result().unwrap(), vec![json!(true)]);

        let err = RpcResponse::error(2, "no such function");
        assert!(matches!(err.into_result(), Err(NetworkError::Remote(m)) if m == "no such function"));
    }
}
