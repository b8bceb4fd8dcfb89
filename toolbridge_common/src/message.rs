//! JSON-RPC 2.0 message model shared by the bridge and its providers.
//!
//! Frames coming out of a child are kept as [`serde_json::Value`] so that
//! responses can be handed back to HTTP callers verbatim; this module only
//! adds the small amount of structure the bridge needs to classify and
//! correlate them.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision advertised in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Standard and bridge-specific JSON-RPC error codes.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Routing referenced a provider that is not registered.
    pub const UNKNOWN_PROVIDER: i64 = -32001;
    /// No response within the init or call timeout.
    pub const TIMEOUT: i64 = -32002;
    /// The provider process could not be started or is gone.
    pub const PROVIDER_UNAVAILABLE: i64 = -32003;
}

/// A JSON-RPC request id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Read an id out of a message. `null` and non-scalar ids count as absent.
    pub fn from_message(message: &Value) -> Option<Self> {
        match message.get("id")? {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }

    /// Key used to correlate responses with pending calls.
    ///
    /// Numbers and strings live in separate key spaces so that `1` and `"1"`
    /// never match each other.
    pub fn correlation_key(&self) -> String {
        match self {
            RequestId::Number(n) => format!("n:{n}"),
            RequestId::String(s) => format!("s:{s}"),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        RequestId::Number(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<RequestId> for Value {
    fn from(id: RequestId) -> Self {
        match id {
            RequestId::Number(n) => Value::from(n),
            RequestId::String(s) => Value::from(s),
        }
    }
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Extract the error member of a response frame, if it has one.
    pub fn from_response(message: &Value) -> Option<Self> {
        let error = message.get("error")?;
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(codes::INTERNAL_ERROR);
        let text = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        Some(Self {
            code,
            message: text,
            data: error.get("data").cloned(),
        })
    }
}

/// What a decoded frame is, judged by the members it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Has `method` and `id`.
    Request,
    /// Has `method` but no `id`.
    Notification,
    /// Has `result` or `error` and no `method`.
    Response,
    /// Anything else: not an object, or none of the above.
    Invalid,
}

impl MessageKind {
    pub fn of(message: &Value) -> Self {
        let Some(object) = message.as_object() else {
            return MessageKind::Invalid;
        };
        let has_method = object.get("method").is_some_and(Value::is_string);
        let has_id = object.get("id").is_some_and(|id| !id.is_null());
        let has_outcome = object.contains_key("result") || object.contains_key("error");

        match (has_method, has_id, has_outcome) {
            (true, true, _) => MessageKind::Request,
            (true, false, _) => MessageKind::Notification,
            (false, _, true) => MessageKind::Response,
            _ => MessageKind::Invalid,
        }
    }
}

/// Build a request object.
pub fn request(id: impl Into<RequestId>, method: &str, params: Option<Value>) -> Value {
    let mut message = json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": Value::from(id.into()),
        "method": method,
    });
    if let Some(params) = params {
        message["params"] = params;
    }
    message
}

/// Build a notification object (no id, no response expected).
pub fn notification(method: &str, params: Option<Value>) -> Value {
    let mut message = json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
    });
    if let Some(params) = params {
        message["params"] = params;
    }
    message
}

/// Build the error envelope returned to HTTP callers on failure.
pub fn error_envelope(code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

/// Params of the `initialize` handshake request.
pub fn initialize_params(client_name: &str, client_version: &str) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": client_name,
            "version": client_version,
        }
    })
}
