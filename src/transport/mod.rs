//! Transport layer: how the connection manager talks to one capability server.
//!
//! The rest of the crate only sees [`ToolTransport`]. Implementations are
//! created per descriptor by a [`TransportFactory`] looked up by endpoint
//! scheme in the [`TransportRegistry`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::descriptor::ServerDescriptor;
use crate::error::Result;

pub mod http;
mod registry;
#[cfg(feature = "stdio")]
pub mod stdio;

#[cfg(test)]
pub(crate) mod mock;

pub use http::{HttpTransport, HttpTransportFactory};
pub use registry::TransportRegistry;
#[cfg(feature = "stdio")]
pub use stdio::{StdioTransport, StdioTransportFactory};

/// Newest protocol revision offered during the handshake.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-03-26";
/// Revision retried once when a server rejects the latest one.
pub const FALLBACK_PROTOCOL_VERSION: &str = "2024-11-05";

/// What the server reported about itself during `initialize`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
    pub instructions: Option<String>,
    pub protocol_version: String,
}

/// One tool as advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTool {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub tags: Vec<String>,
}

impl RemoteTool {
    /// Build from a raw `tools/list` entry. Returns `None` when it has no name.
    pub fn from_wire(raw: &Value) -> Option<Self> {
        let name = raw.get("name")?.as_str()?.trim();
        if name.is_empty() {
            return None;
        }
        let description = raw
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);
        let input_schema = raw
            .get("inputSchema")
            .filter(|schema| schema.is_object())
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "type": "object" }));

        Some(Self {
            name: name.to_string(),
            description,
            input_schema,
            tags: wire_tags(raw),
        })
    }
}

/// Tags from `_meta.tags`, falling back to `annotations.tags`.
fn wire_tags(raw: &Value) -> Vec<String> {
    ["_meta", "annotations"]
        .iter()
        .filter_map(|key| raw.get(*key)?.get("tags")?.as_array())
        .next()
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(|tag| tag.trim().to_ascii_lowercase())
                .filter(|tag| !tag.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Result of one `tools/call`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallResult {
    pub structured_content: Option<Value>,
    pub text_content: Option<String>,
    pub content: Vec<Value>,
    /// The tool ran but reported failure.
    pub is_error: bool,
}

impl ToolCallResult {
    /// Build from a raw `tools/call` result object.
    pub fn from_wire(raw: &Value) -> Self {
        let content = raw
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Self {
            structured_content: raw
                .get("structuredContent")
                .filter(|v| !v.is_null())
                .cloned(),
            text_content: extract_text_content(&content),
            content,
            is_error: raw.get("isError").and_then(Value::as_bool).unwrap_or(false),
        }
    }

    /// Payload handed back to the caller.
    ///
    /// Structured content wins, then joined text, then the single content
    /// item, then the full content list.
    pub fn into_value_or_text(self) -> Value {
        if let Some(structured) = self.structured_content {
            return structured;
        }
        if let Some(text) = self.text_content {
            return Value::String(text);
        }
        let mut content = self.content;
        if content.len() == 1 {
            return content.remove(0);
        }
        Value::Array(content)
    }

    /// Human-readable message for an error result.
    pub fn error_message(&self) -> String {
        self.text_content
            .clone()
            .or_else(|| self.structured_content.as_ref().map(Value::to_string))
            .unwrap_or_else(|| "tool returned an error result".into())
    }
}

fn extract_text_content(content: &[Value]) -> Option<String> {
    let mut lines = Vec::new();
    for item in content {
        match item.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    lines.push(text.to_string());
                }
            }
            Some("resource") => {
                if let Some(text) = item
                    .get("resource")
                    .and_then(|r| r.get("text"))
                    .and_then(Value::as_str)
                {
                    lines.push(text.to_string());
                }
            }
            _ => {}
        }
    }

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Session with one capability server.
///
/// Methods take `&self` so a ready transport can serve concurrent calls.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Perform the protocol handshake. Called again to probe a degraded server.
    async fn connect(&self) -> Result<ServerInfo>;

    /// List every tool the server advertises.
    async fn list_tools(&self) -> Result<Vec<RemoteTool>>;

    /// Invoke one tool. Remote protocol errors come back as
    /// [`ToolHostError::Server`](crate::error::ToolHostError::Server).
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult>;

    /// Release the session. Must be idempotent.
    async fn close(&self) -> Result<()>;
}

/// Creates transports for the endpoint schemes it declares.
pub trait TransportFactory: Send + Sync {
    fn schemes(&self) -> &[&str];

    fn create(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn ToolTransport>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn remote_tool_reads_schema_and_tags() {
        let tool = RemoteTool::from_wire(&json!({
            "name": "search",
            "description": "Search the web",
            "inputSchema": {"type": "object", "required": ["q"]},
            "_meta": {"tags": ["Web", " search "]}
        }))
        .expect("tool should parse");

        assert_eq!(tool.name, "search");
        assert_eq!(tool.description.as_deref(), Some("Search the web"));
        assert_eq!(tool.input_schema["required"], json!(["q"]));
        assert_eq!(tool.tags, vec!["web".to_string(), "search".to_string()]);
    }

    #[test]
    fn remote_tool_defaults_missing_schema() {
        let tool = RemoteTool::from_wire(&json!({"name": "ping"})).expect("tool should parse");
        assert_eq!(tool.input_schema, json!({"type": "object"}));
        assert!(tool.tags.is_empty());
        assert!(RemoteTool::from_wire(&json!({"description": "nameless"})).is_none());
    }

    #[test]
    fn call_result_prefers_structured_content() {
        let result = ToolCallResult::from_wire(&json!({
            "content": [{"type": "text", "text": "42"}],
            "structuredContent": {"answer": 42}
        }));
        assert_eq!(result.into_value_or_text(), json!({"answer": 42}));
    }

    #[test]
    fn call_result_joins_text_content() {
        let result = ToolCallResult::from_wire(&json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "resource", "resource": {"uri": "file:///a", "text": "line two"}}
            ]
        }));
        assert_eq!(result.into_value_or_text(), json!("line one\nline two"));
    }

    #[test]
    fn call_result_unwraps_single_non_text_item() {
        let image = json!({"type": "image", "data": "AAAA", "mimeType": "image/png"});
        let result = ToolCallResult::from_wire(&json!({ "content": [image.clone()] }));
        assert_eq!(result.into_value_or_text(), image);
    }

    #[test]
    fn error_result_message_uses_text() {
        let result = ToolCallResult::from_wire(&json!({
            "content": [{"type": "text", "text": "quota exceeded"}],
            "isError": true
        }));
        assert!(result.is_error);
        assert_eq!(result.error_message(), "quota exceeded");
    }
}
