use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{ApplicationError, BridgeError, DispatchError, TransportError};

/// JSON‑RPC 2.0 envelopes exchanged between host and plugin, one per line.
///
/// A request carries `id`, `method` and `params`; the matching response
/// carries the same `id` and exactly one of `result` or `error`. Requests
/// without an `id` are notifications and never get a response.
///
/// ```ignore
/// use plugin_bridge::jsonrpc::{Id, Request};
///
/// let req = Request::call(Id::Number(1), "cd_executor.CdExec", Some(json!({"key": "value"})));
/// let line = serde_json::to_string(&req)?;
/// ```
pub const JSONRPC_VERSION: &str = "2.0";

// Error codes. The -32000..-32099 range is reserved for server-defined errors.
pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const APPLICATION_ERROR: i64 = -32000;
pub const UNKNOWN_CAPABILITY: i64 = -32001;

/// `id` MAY be a string, number or null. We support all forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(u64),
    String(String),
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Omitted for *notifications*.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Error {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Exactly one of `result` or `error` **must** be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    pub id: Id,
}

/// Lets a reader `serde_json::from_str::<Message>()` without inspecting the line first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// Parses one wire line.
    pub fn parse(line: &str) -> Result<Self, TransportError> {
        serde_json::from_str(line).map_err(|e| TransportError::MalformedEnvelope(e.to_string()))
    }
}

impl Request {
    /// Create a *notification* (no response expected).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// Create a *call* expecting a response.
    pub fn call(id: Id, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

impl Response {
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn fail(id: Id, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(Error {
                code,
                message: message.into(),
                data,
            }),
            id,
        }
    }

    /// Builds the response for a finished dispatch, mapping bridge errors to codes.
    pub fn from_outcome(id: Id, outcome: Result<Value, BridgeError>) -> Self {
        match outcome {
            Ok(value) => Self::success(id, value),
            Err(BridgeError::Application(err)) => Self::fail(id, APPLICATION_ERROR, err.message, None),
            Err(BridgeError::Dispatch(DispatchError::UnknownCapability { name })) => Self::fail(
                id,
                UNKNOWN_CAPABILITY,
                "Unknown capability",
                Some(json!(name)),
            ),
            Err(BridgeError::Dispatch(DispatchError::UnknownMethod { method })) => {
                Self::fail(id, METHOD_NOT_FOUND, "Method not found", Some(json!(method)))
            }
            Err(BridgeError::Dispatch(DispatchError::InvalidParams { method, message })) => {
                Self::fail(id, INVALID_PARAMS, message, Some(json!(method)))
            }
            Err(other) => Self::fail(id, INTERNAL_ERROR, other.to_string(), None),
        }
    }

    /// Turns a received response back into the caller-facing result.
    pub fn into_result(self) -> Result<Value, BridgeError> {
        let Some(err) = self.error else {
            return Ok(self.result.unwrap_or(Value::Null));
        };
        let detail = err
            .data
            .as_ref()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        Err(match err.code {
            APPLICATION_ERROR => ApplicationError::new(err.message).into(),
            UNKNOWN_CAPABILITY => DispatchError::UnknownCapability { name: detail }.into(),
            METHOD_NOT_FOUND => DispatchError::UnknownMethod { method: detail }.into(),
            INVALID_PARAMS => DispatchError::InvalidParams {
                method: detail,
                message: err.message,
            }
            .into(),
            code => TransportError::Remote {
                code,
                message: err.message,
            }
            .into(),
        })
    }
}
