//! JSON-RPC 2.0 envelopes exchanged with the host.

use serde::{Deserialize, Deserializer, Serialize};
use tether_types::ToolResult;

/// A JSON-RPC 2.0 request, POSTed to the session's message endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: String,
    pub params: serde_json::Value,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Build the `tools/reply` envelope answering an inbound call.
    pub fn reply(call_id: impl Into<String>, result: &ToolResult) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            call_id,
            "tools/reply",
            serde_json::json!({ "result": serde_json::to_value(result)? }),
        ))
    }
}

/// A JSON-RPC 2.0 response, delivered over the event stream.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    /// `Some(Value::Null)` for an explicit `"result": null`, `None` when absent.
    #[serde(default, deserialize_with = "present")]
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl JsonRpcResponse {
    /// The correlation key of this response, normalised to a string.
    pub fn correlation_id(&self) -> Option<String> {
        match self.id.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<serde_json::Value>,
}
