//! Tool result and registration types shared between the link and handlers.

use serde::{Deserialize, Serialize};

/// The only shape a tool handler may return to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

/// A content item in a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Content kinds this crate does not interpret (resources, audio, ...).
    #[serde(other)]
    Other,
}

impl ToolResult {
    /// Create a successful text result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Create an error text result.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// Text of the first text content item, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|c| match c {
            ToolContent::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// Everything the host needs to list a remote tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRegistration {
    /// Unique tool name the host will route calls by.
    pub tool_name: String,
    /// Short note telling an agent when to use the tool.
    pub readme: String,
    /// Full usage documentation.
    pub description: String,
    /// JSON Schema for the tool's input.
    pub parameters: serde_json::Value,
    /// Opaque routing identifier for reverse calls.
    pub callback_endpoint: String,
    #[serde(rename = "TOOL_API_KEY")]
    pub api_key: String,
}
