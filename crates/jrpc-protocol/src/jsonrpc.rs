//! NUL-terminated JSON-RPC messages.
//!
//! Requests are `{"method": ..., "params": ...}` objects followed by a single
//! NUL byte. Responses are `{"jsonrpc": "2.0", "result": ...}` or
//! `{"jsonrpc": "2.0", "error": "<message>"}`, also NUL-terminated on the
//! plain protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Result of a registered method.
pub type HandlerResult = Result<Value, RpcError>;

/// An RPC call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcSuccessResponse {
    pub jsonrpc: String,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorResponse {
    pub jsonrpc: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RpcResponse {
    Success(RpcSuccessResponse),
    Error(RpcErrorResponse),
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

impl RpcRequest {
    /// Build a request as a client sends it. Missing params become `[]`.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.into()),
            method: method.into(),
            params: params.unwrap_or_else(|| Value::Array(Vec::new())),
        }
    }

    /// Parse one complete message as received by the server.
    ///
    /// A trailing NUL terminator is tolerated. Each failure maps onto the
    /// error that gets echoed back to the caller.
    pub fn parse(message: &[u8]) -> Result<Self, RpcError> {
        let value: Value = serde_json::from_slice(strip_terminator(message))
            .map_err(|e| RpcError::parse_error(format!("request is not valid JSON: {e}")))?;

        let Value::Object(mut object) = value else {
            return Err(RpcError::invalid_request("request is not a JSON object"));
        };

        let method = match object.remove("method") {
            Some(Value::String(method)) => method,
            Some(_) => return Err(RpcError::invalid_request("invalid request, method must be a string")),
            None => return Err(RpcError::invalid_request("invalid request, method is missing")),
        };

        let params = object.remove("params").ok_or_else(|| {
            RpcError::invalid_request(format!("invalid request {method}, params is missing"))
        })?;

        let jsonrpc = match object.remove("jsonrpc") {
            Some(Value::String(v)) => Some(v),
            _ => None,
        };

        Ok(Self { jsonrpc, method, params })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────────────────────

impl RpcResponse {
    pub fn success(result: Value) -> Self {
        Self::Success(RpcSuccessResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            result,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(RpcErrorResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            error: message.into(),
        })
    }

    pub fn from_result(result: HandlerResult) -> Self {
        match result {
            Ok(value) => Self::success(value),
            Err(err) => Self::error(err.message),
        }
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self {
            Self::Success(s) => Ok(s.result),
            Self::Error(e) => Err(RpcError::remote(e.error)),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Framing
// ─────────────────────────────────────────────────────────────────────────────

/// Length of the first complete NUL-terminated JSON object in `buf`,
/// terminator included.
///
/// Completeness is brace-depth counting: the message ends where a closing
/// brace brings the depth back to zero and the very next byte is NUL. Braces
/// inside string literals don't count, and a stray closing brace at depth
/// zero is ignored.
pub fn complete_message_len(buf: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in buf.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => depth += 1,
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    match buf.get(i + 1) {
                        Some(0) => return Some(i + 2),
                        Some(_) => {}
                        None => return None,
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Drop trailing NUL terminators.
pub fn strip_terminator(mut message: &[u8]) -> &[u8] {
    while let [rest @ .., 0] = message {
        message = rest;
    }
    message
}
