//! Session error taxonomy
//!
//! `SessionError` is what the public API surfaces: protocol failures from
//! the layers below, backend startup failures, capability mismatches and
//! session-level conditions like an unhandled server request.

use crate::capability::CapabilityMismatch;
use crate::client::session::SessionState;
use crate::document::DocumentError;
use crate::jsonrpc::error::RpcError;
use crate::jsonrpc::types::JsonRpcErrorObject;
use crate::server::error::{BackendError, BackendSelectionError};

/// Errors surfaced by the session API
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Selection(#[from] BackendSelectionError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    CapabilityMismatch(#[from] CapabilityMismatch),

    /// The server sent a request no capability unit handles. This is
    /// session-fatal: the server is blocked waiting for an answer the
    /// client cannot give.
    #[error("Unhandled server request method: {method}")]
    UnhandledServerRequest { method: String },

    /// The server answered a request with an error object
    #[error("Server returned an error: {0}")]
    ServerError(JsonRpcErrorObject),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Session is {actual:?}, operation requires {required:?}")]
    InvalidState {
        actual: SessionState,
        required: SessionState,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
