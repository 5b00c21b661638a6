use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::JSONRPC_VERSION;

/// Errors raised when a line cannot be treated as a frame.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The line is not a JSON object (non-JSON noise, or a bare scalar/array).
    #[error("not a JSON-RPC object: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One newline-delimited JSON-RPC 2.0 frame.
///
/// Only the envelope fields are modeled; anything else a peer put in the
/// object survives in `extra` and is re-emitted unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Frame {
    /// Parse one line. Fails on anything that is not a JSON object.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(line)?)
    }

    /// Serialize back to a single line (no trailing newline).
    #[must_use]
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).expect("frame serializes")
    }

    /// Build a request frame.
    #[must_use]
    pub fn request(id: impl Into<Value>, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: Some(id.into()),
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
            extra: Map::new(),
        }
    }

    /// Build a notification frame (no id).
    #[must_use]
    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: None,
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
            extra: Map::new(),
        }
    }

    /// Build a success response frame.
    #[must_use]
    pub fn response(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
            extra: Map::new(),
        }
    }

    /// Build an error response frame.
    #[must_use]
    pub fn error_response(id: Option<Value>, code: i64, message: &str) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id,
            method: None,
            params: None,
            result: None,
            error: Some(json!({ "code": code, "message": message })),
            extra: Map::new(),
        }
    }

    /// The request id as a map key. Ids may be strings or numbers on the
    /// wire; both compare by their JSON rendering.
    #[must_use]
    pub fn id_key(&self) -> Option<String> {
        match self.id.as_ref()? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Is this a response whose `result` carries a `tools` array
    /// (i.e. a reply to `tools/list`)?
    #[must_use]
    pub fn is_tools_list_response(&self) -> bool {
        self.tools().is_some()
    }

    /// The `result.tools` array, if present.
    #[must_use]
    pub fn tools(&self) -> Option<&Vec<Value>> {
        self.result.as_ref()?.get("tools")?.as_array()
    }

    /// Mutable access to `result.tools`, for the bridge's filter pass.
    pub fn tools_mut(&mut self) -> Option<&mut Vec<Value>> {
        self.result.as_mut()?.get_mut("tools")?.as_array_mut()
    }

    /// The `params.name` of a `tools/call` request.
    #[must_use]
    pub fn tool_call_name(&self) -> Option<&str> {
        if self.method.as_deref() != Some(crate::methods::TOOLS_CALL) {
            return None;
        }
        self.params.as_ref()?.get("name")?.as_str()
    }

    /// The `params.include_disabled` flag on a `tools/list` request.
    #[must_use]
    pub fn include_disabled(&self) -> bool {
        if self.method.as_deref() != Some(crate::methods::TOOLS_LIST) {
            return false;
        }
        self.params
            .as_ref()
            .and_then(|p| p.get("include_disabled"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
