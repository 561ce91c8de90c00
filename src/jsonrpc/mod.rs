//! JSON-RPC 2.0 protocol layer
//!
//! Everything between the byte transport and the session orchestrator:
//! the wire message model, Content-Length framing, the request/response
//! correlation table and the protocol error taxonomy.

pub mod correlation;
pub mod error;
pub mod framing;
pub mod types;

pub use correlation::{CorrelationTable, ResponseOutcome};
pub use error::RpcError;
pub use framing::FramedTransport;
pub use types::{
    JsonRpcErrorObject, JsonRpcErrorResponse, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse,
};
