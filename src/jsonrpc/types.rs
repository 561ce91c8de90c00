//! JSON-RPC 2.0 wire message model
//!
//! The four message shapes that can appear on an LSP connection, with
//! classification from untyped JSON. Requests carry an id and a method,
//! notifications a method only, and the two response shapes carry an id
//! with either a result or an error object.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jsonrpc::error::RpcError;

/// JSON-RPC version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// JSON-RPC request message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new<I: Into<Value>, M: Into<String>>(id: I, method: M, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC notification message (no id, no response expected)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new<M: Into<String>>(method: M, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC success response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default)]
    pub result: Value,
}

impl JsonRpcResponse {
    pub fn new(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        }
    }
}

/// JSON-RPC error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: String,
    pub id: Value,
    pub error: JsonRpcErrorObject,
}

impl JsonRpcErrorResponse {
    pub fn new(id: Value, error: JsonRpcErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error,
        }
    }
}

/// Error payload carried by an error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorObject {
    pub fn new<M: Into<String>>(code: i64, message: M) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn internal_error<M: Into<String>>(message: M) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }
}

impl std::fmt::Display for JsonRpcErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Any message that can appear on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    ErrorResponse(JsonRpcErrorResponse),
}

impl JsonRpcMessage {
    /// Classify an untyped JSON value into one of the four message shapes.
    ///
    /// A `method` key plus an `id` makes a request, `method` alone a
    /// notification; without `method`, an `error` key makes an error
    /// response and an `id` a success response.
    pub fn from_value(value: Value) -> Result<Self, RpcError> {
        let obj = value
            .as_object()
            .ok_or_else(|| RpcError::parse("message is not a JSON object"))?;

        if obj.contains_key("method") {
            if obj.contains_key("id") {
                let request: JsonRpcRequest = serde_json::from_value(value)?;
                Ok(JsonRpcMessage::Request(request))
            } else {
                let notification: JsonRpcNotification = serde_json::from_value(value)?;
                Ok(JsonRpcMessage::Notification(notification))
            }
        } else if obj.contains_key("error") {
            let response: JsonRpcErrorResponse = serde_json::from_value(value)?;
            Ok(JsonRpcMessage::ErrorResponse(response))
        } else if obj.contains_key("id") {
            let response: JsonRpcResponse = serde_json::from_value(value)?;
            Ok(JsonRpcMessage::Response(response))
        } else {
            Err(RpcError::parse(
                "message has neither a method nor a response id",
            ))
        }
    }

    /// Parse a raw message body
    pub fn from_json(body: &str) -> Result<Self, RpcError> {
        let value: Value = serde_json::from_str(body)?;
        Self::from_value(value)
    }

    /// Serialize for the wire
    pub fn to_json(&self) -> Result<String, RpcError> {
        let body = match self {
            JsonRpcMessage::Request(m) => serde_json::to_string(m)?,
            JsonRpcMessage::Notification(m) => serde_json::to_string(m)?,
            JsonRpcMessage::Response(m) => serde_json::to_string(m)?,
            JsonRpcMessage::ErrorResponse(m) => serde_json::to_string(m)?,
        };
        Ok(body)
    }

    /// The method name, for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(m) => Some(&m.method),
            JsonRpcMessage::Notification(m) => Some(&m.method),
            _ => None,
        }
    }
}

/// Normalize a JSON-RPC id into the string key used by the correlation table.
///
/// The client always issues string ids, but servers may echo numeric ids in
/// their own requests; both forms normalize to the same key.
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
