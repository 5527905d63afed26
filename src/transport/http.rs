//! Streamable HTTP transport: JSON-RPC over `POST`, answered with either a
//! JSON body or an event stream.

use std::collections::HashSet;
use std::string::FromUtf8Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    RemoteTool, ServerInfo, ToolCallResult, ToolTransport, TransportFactory,
    FALLBACK_PROTOCOL_VERSION, LATEST_PROTOCOL_VERSION,
};
use crate::descriptor::ServerDescriptor;
use crate::error::{Result, ToolHostError};

/// Session header assigned by the server on `initialize`.
pub const SESSION_HEADER: &str = "mcp-session-id";

const ACCEPT_BOTH: &str = "application/json, text/event-stream";
const CLIENT_NAME: &str = env!("CARGO_PKG_NAME");
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Get (or create) the shared reqwest client.
///
/// No overall request timeout: per-call deadlines are applied by the caller.
pub fn shared_client() -> &'static reqwest::Client {
    SHARED_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to build HTTP client")
    })
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Transport for `http://` and `https://` endpoints.
pub struct HttpTransport {
    server: String,
    endpoint: Url,
    headers: HeaderMap,
    client: reqwest::Client,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl HttpTransport {
    /// Build a transport carrying the descriptor's headers on every request.
    pub fn new(descriptor: &ServerDescriptor) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in descriptor.headers() {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                ToolHostError::Configuration(format!("invalid header name '{name}'"))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|_| {
                ToolHostError::Configuration(format!("invalid value for header '{name}'"))
            })?;
            headers.insert(header_name, header_value);
        }

        Ok(Self {
            server: descriptor.name().to_string(),
            endpoint: descriptor.endpoint().clone(),
            headers,
            client: shared_client().clone(),
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    /// Use a specific reqwest client instead of the shared one.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Session id issued by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_session_id(&self, value: Option<String>) {
        *self
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = value;
    }

    fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_BOTH));
        if let Some(session) = self.session_id() {
            if let Ok(value) = HeaderValue::from_str(&session) {
                headers.insert(SESSION_HEADER, value);
            }
        }
        headers
    }

    async fn post(&self, body: &JsonRpcRequest<'_>) -> Result<Response> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.request_headers())
            .json(body)
            .send()
            .await
            .map_err(|e| self.connection_error(format!("{} request failed: {e}", body.method)))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.set_session_id(Some(session.to_string()));
        }

        let status = response.status();
        if !status.is_success() {
            if status == StatusCode::NOT_FOUND && self.session_id().is_some() {
                self.set_session_id(None);
                return Err(self.connection_error("session expired"));
            }
            let text = response.text().await.unwrap_or_default();
            return Err(self.connection_error(format!(
                "{} returned HTTP {}: {}",
                body.method,
                status.as_u16(),
                text.trim()
            )));
        }
        Ok(response)
    }

    /// Send a request and wait for the matching response.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        };
        tracing::debug!(server = %self.server, method, id, "sending request");

        let response = self.post(&body).await?;
        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

        let reply = if is_stream {
            self.read_event_stream(response, id).await?
        } else {
            let raw: Value = response
                .json()
                .await
                .map_err(|e| self.connection_error(format!("{method}: invalid JSON body: {e}")))?;
            find_response(raw, id)
                .ok_or_else(|| self.connection_error(format!("{method}: no response for id {id}")))?
        };

        self.reply_result(reply)
    }

    /// Send a notification; the body of the reply is ignored.
    async fn notify(&self, method: &str) -> Result<()> {
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params: None,
        };
        self.post(&body).await.map(|_| ())
    }

    async fn read_event_stream(&self, response: Response, id: u64) -> Result<JsonRpcResponse> {
        let stream = response.bytes_stream();
        futures::pin_mut!(stream);
        let mut lines = LineBuffer::default();
        let mut data = Vec::<String>::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.connection_error(format!("event stream: {e}")))?;
            lines.push(&chunk);

            while let Some(line) = lines.next_line() {
                let line = self.decode_line(line)?;
                if line.is_empty() {
                    if let Some(reply) = take_event(&mut data, id) {
                        return Ok(reply);
                    }
                    continue;
                }
                if let Some(payload) = parse_sse_data(&line) {
                    data.push(payload.to_string());
                }
            }
        }

        if let Some(line) = lines.finish() {
            let line = self.decode_line(line)?;
            if let Some(payload) = parse_sse_data(&line) {
                data.push(payload.to_string());
            }
        }
        take_event(&mut data, id)
            .ok_or_else(|| self.connection_error("event stream ended before a response arrived"))
    }

    fn decode_line(&self, line: std::result::Result<String, FromUtf8Error>) -> Result<String> {
        line.map_err(|e| self.connection_error(format!("event stream is not valid UTF-8: {e}")))
    }

    fn reply_result(&self, reply: JsonRpcResponse) -> Result<Value> {
        if let Some(error) = reply.error {
            return Err(ToolHostError::Server {
                server: self.server.clone(),
                code: Some(error.code),
                message: error.message,
                data: error.data,
            });
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }

    fn connection_error(&self, message: impl Into<String>) -> ToolHostError {
        ToolHostError::connection(self.server.clone(), message)
    }

    async fn initialize(&self, protocol_version: &str) -> Result<Value> {
        self.request(
            "initialize",
            Some(json!({
                "protocolVersion": protocol_version,
                "capabilities": {},
                "clientInfo": { "name": CLIENT_NAME, "version": CLIENT_VERSION },
            })),
        )
        .await
    }
}

/// Splits event-stream bytes into lines. A line is decoded only once its
/// terminating newline has arrived, so multi-byte characters may span chunks.
#[derive(Debug, Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<std::result::Result<String, FromUtf8Error>> {
        let end = self.bytes.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.bytes.drain(..=end).collect();
        line.pop();
        Some(String::from_utf8(strip_cr(line)))
    }

    /// Whatever is left once the stream has ended.
    fn finish(&mut self) -> Option<std::result::Result<String, FromUtf8Error>> {
        if self.bytes.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.bytes);
        Some(String::from_utf8(strip_cr(line)))
    }
}

fn strip_cr(mut line: Vec<u8>) -> Vec<u8> {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    line
}

/// Parse an SSE `data:` line.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?;
    Some(data.strip_prefix(' ').unwrap_or(data))
}

/// Whether an initialize failure is a protocol version mismatch.
pub fn is_protocol_version_error(error: &ToolHostError) -> bool {
    match error {
        ToolHostError::Server { message, .. } => {
            let message = message.to_ascii_lowercase();
            message.contains("protocol") && message.contains("version")
        }
        _ => false,
    }
}

/// Pull the response for `id` from one accumulated event, if it is one.
fn take_event(data: &mut Vec<String>, id: u64) -> Option<JsonRpcResponse> {
    if data.is_empty() {
        return None;
    }
    let joined = data.join("\n");
    data.clear();
    let raw: Value = serde_json::from_str(&joined).ok()?;
    find_response(raw, id)
}

/// Find the response for `id` in a message or batch, skipping server requests
/// and notifications.
fn find_response(raw: Value, id: u64) -> Option<JsonRpcResponse> {
    let messages = match raw {
        Value::Array(items) => items,
        other => vec![other],
    };
    messages
        .into_iter()
        .filter(|message| message.get("method").is_none())
        .filter_map(|message| serde_json::from_value::<JsonRpcResponse>(message).ok())
        .find(|reply| reply.id == json!(id))
}

fn server_info(result: &Value, requested: &str) -> ServerInfo {
    let info = result.get("serverInfo");
    let field = |key: &str| {
        info.and_then(|i| i.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    ServerInfo {
        name: field("name"),
        version: field("version"),
        instructions: result
            .get("instructions")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        protocol_version: result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or(requested)
            .to_string(),
    }
}

#[async_trait]
impl ToolTransport for HttpTransport {
    async fn connect(&self) -> Result<ServerInfo> {
        self.set_session_id(None);

        let (result, requested) = match self.initialize(LATEST_PROTOCOL_VERSION).await {
            Ok(result) => (result, LATEST_PROTOCOL_VERSION),
            Err(error) if is_protocol_version_error(&error) => {
                tracing::debug!(
                    server = %self.server,
                    fallback = FALLBACK_PROTOCOL_VERSION,
                    "retrying initialize with older protocol version"
                );
                self.set_session_id(None);
                let result = self.initialize(FALLBACK_PROTOCOL_VERSION).await?;
                (result, FALLBACK_PROTOCOL_VERSION)
            }
            Err(error) => return Err(error),
        };

        self.notify("notifications/initialized").await?;
        Ok(server_info(&result, requested))
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();

        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page = self.request("tools/list", params).await?;
            if let Some(entries) = page.get("tools").and_then(Value::as_array) {
                tools.extend(entries.iter().filter_map(RemoteTool::from_wire));
            }

            match page.get("nextCursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() => {
                    if !seen.insert(next.to_string()) {
                        tracing::warn!(server = %self.server, cursor = next, "repeated tools/list cursor");
                        break;
                    }
                    cursor = Some(next.to_string());
                }
                _ => break,
            }
        }
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        let mut params = json!({ "name": name });
        match arguments {
            Value::Null => {}
            Value::Object(map) => {
                params["arguments"] = Value::Object(map);
            }
            other => {
                return Err(ToolHostError::InvalidRequest(format!(
                    "tool arguments must be a JSON object; got {other}"
                )))
            }
        }
        let result = self.request("tools/call", Some(params)).await?;
        Ok(ToolCallResult::from_wire(&result))
    }

    async fn close(&self) -> Result<()> {
        let Some(session) = self.session_id() else {
            return Ok(());
        };
        self.set_session_id(None);

        let mut headers = self.headers.clone();
        if let Ok(value) = HeaderValue::from_str(&session) {
            headers.insert(SESSION_HEADER, value);
        }
        if let Err(e) = self
            .client
            .delete(self.endpoint.clone())
            .headers(headers)
            .send()
            .await
        {
            tracing::debug!(server = %self.server, error = %e, "session close failed");
        }
        Ok(())
    }
}

/// Factory for `http` and `https` endpoints.
pub struct HttpTransportFactory;

impl TransportFactory for HttpTransportFactory {
    fn schemes(&self) -> &[&str] {
        &["http", "https"]
    }

    fn create(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn ToolTransport>> {
        Ok(Arc::new(HttpTransport::new(descriptor)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_sse_data_accepts_optional_space() {
        assert_eq!(parse_sse_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(parse_sse_data("data:{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(parse_sse_data("event: message"), None);
    }

    #[test]
    fn find_response_skips_notifications_and_other_ids() {
        let batch = json!([
            {"jsonrpc": "2.0", "method": "notifications/progress", "params": {}},
            {"jsonrpc": "2.0", "id": 6, "result": {"wrong": true}},
            {"jsonrpc": "2.0", "id": 7, "result": {"ok": true}}
        ]);
        let reply = find_response(batch, 7).expect("response for id 7");
        assert_eq!(reply.result, Some(json!({"ok": true})));
    }

    #[test]
    fn line_buffer_keeps_characters_split_across_chunks() {
        let line = "data: café 中文\r\n".as_bytes();
        let split = line
            .iter()
            .position(|b| *b == 0xC3)
            .expect("é starts with 0xC3")
            + 1;

        let mut lines = LineBuffer::default();
        lines.push(&line[..split]);
        assert!(lines.next_line().is_none());
        lines.push(&line[split..]);
        assert_eq!(
            lines.next_line().map(|l| l.expect("valid UTF-8")),
            Some("data: café 中文".to_string())
        );
        assert!(lines.finish().is_none());
    }

    #[test]
    fn line_buffer_rejects_invalid_utf8() {
        let mut lines = LineBuffer::default();
        lines.push(b"data: \xC3(\n");
        assert!(matches!(lines.next_line(), Some(Err(_))));

        lines.push(b"data: tail");
        assert_eq!(
            lines.finish().map(|l| l.expect("valid UTF-8")),
            Some("data: tail".to_string())
        );
    }

    #[test]
    fn take_event_joins_multiline_data() {
        let mut data = vec![
            "{\"jsonrpc\":\"2.0\",".to_string(),
            "\"id\":3,\"result\":{}}".to_string(),
        ];
        assert!(take_event(&mut data, 3).is_some());
        assert!(data.is_empty());
    }

    #[test]
    fn protocol_version_errors_are_detected() {
        let err = ToolHostError::Server {
            server: "alpha".into(),
            code: Some(-32602),
            message: "Unsupported protocol version".into(),
            data: None,
        };
        assert!(is_protocol_version_error(&err));
        assert!(!is_protocol_version_error(&ToolHostError::connection("alpha", "down")));
    }

    #[test]
    fn server_info_reads_instructions() {
        let info = server_info(
            &json!({
                "protocolVersion": "2024-11-05",
                "serverInfo": {"name": "search", "version": "1.2.0"},
                "instructions": "  Prefer precise queries.  "
            }),
            LATEST_PROTOCOL_VERSION,
        );
        assert_eq!(info.name.as_deref(), Some("search"));
        assert_eq!(info.instructions.as_deref(), Some("Prefer precise queries."));
        assert_eq!(info.protocol_version, "2024-11-05");
    }
}
