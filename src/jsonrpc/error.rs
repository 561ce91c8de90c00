//! Protocol error taxonomy
//!
//! `RpcError` covers every failure between the byte stream and the caller:
//! transport loss, malformed frames, serialization, and timeouts.

use std::time::Duration;

/// Errors produced by the JSON-RPC protocol layer
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The underlying byte stream failed or was closed by the peer
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame or message body could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// A frame declared a body larger than the codec allows
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A request did not receive its response within the deadline
    #[error("Request '{method}' timed out after {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },

    /// In-flight requests did not drain within the deadline
    #[error("Timed out waiting for {pending} in-flight request(s)")]
    DrainTimeout { pending: usize },

    /// The waiter for a request was dropped before a response arrived
    #[error("Response channel closed for request {id}")]
    ChannelClosed { id: String },
}

impl RpcError {
    pub fn transport<S: Into<String>>(message: S) -> Self {
        RpcError::Transport(message.into())
    }

    pub fn parse<S: Into<String>>(message: S) -> Self {
        RpcError::Parse(message.into())
    }

    /// The peer closed the connection
    pub fn connection_closed() -> Self {
        RpcError::Transport("server connection closed".to_string())
    }

    pub fn request_timeout<S: Into<String>>(method: S, timeout: Duration) -> Self {
        RpcError::RequestTimeout {
            method: method.into(),
            timeout,
        }
    }
}
