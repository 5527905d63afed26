//! Instrumented in-memory transport shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{RemoteTool, ServerInfo, ToolCallResult, ToolTransport, TransportFactory};
use crate::descriptor::ServerDescriptor;
use crate::error::{Result, ToolHostError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallFailure {
    /// Connection-level failure; degrades the server.
    Transport,
    /// JSON-RPC error from the server.
    Protocol,
    /// The tool ran and reported `isError`.
    ToolError,
}

pub(crate) fn tool(name: &str, description: &str) -> RemoteTool {
    RemoteTool {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema: json!({ "type": "object" }),
        tags: Vec::new(),
    }
}

/// `search` tool requiring a string `query`.
pub(crate) fn search_tool() -> RemoteTool {
    RemoteTool {
        name: "search".to_string(),
        description: Some("Search documents".to_string()),
        input_schema: json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        }),
        tags: vec!["search".to_string()],
    }
}

pub(crate) struct MockTransport {
    server: String,
    instructions: Option<String>,
    tools: Mutex<Vec<RemoteTool>>,
    delay: Mutex<Duration>,
    connect_failing: AtomicBool,
    call_failure: Mutex<Option<CallFailure>>,
    connects: AtomicUsize,
    lists: AtomicUsize,
    calls: Mutex<Vec<(String, Value)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    closed: AtomicBool,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub(crate) fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            instructions: None,
            tools: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
            connect_failing: AtomicBool::new(false),
            call_failure: Mutex::new(None),
            connects: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn with_tool(self, tool: RemoteTool) -> Self {
        self.tools.lock().expect("tools lock").push(tool);
        self
    }

    pub(crate) fn with_instructions(mut self, instructions: &str) -> Self {
        self.instructions = Some(instructions.to_string());
        self
    }

    pub(crate) fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(delay);
        self
    }

    pub(crate) fn failing_connect(self) -> Self {
        self.set_connect_failing(true);
        self
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("delay lock") = delay;
    }

    pub(crate) fn set_connect_failing(&self, failing: bool) {
        self.connect_failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn set_call_failure(&self, failure: Option<CallFailure>) {
        *self.call_failure.lock().expect("failure lock") = failure;
    }

    pub(crate) fn set_tools(&self, tools: Vec<RemoteTool>) {
        *self.tools.lock().expect("tools lock") = tools;
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub(crate) fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn delay(&self) -> Duration {
        *self.delay.lock().expect("delay lock")
    }
}

#[async_trait]
impl ToolTransport for MockTransport {
    async fn connect(&self) -> Result<ServerInfo> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.connect_failing.load(Ordering::SeqCst) {
            return Err(ToolHostError::connection(self.server.clone(), "connection refused"));
        }
        self.closed.store(false, Ordering::SeqCst);
        Ok(ServerInfo {
            name: Some(self.server.clone()),
            version: Some("0.0.0".into()),
            instructions: self.instructions.clone(),
            protocol_version: super::LATEST_PROTOCOL_VERSION.into(),
        })
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        Ok(self.tools.lock().expect("tools lock").clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((name.to_string(), arguments.clone()));

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = *self.call_failure.lock().expect("failure lock");
        match failure {
            Some(CallFailure::Transport) => Err(ToolHostError::connection(
                self.server.clone(),
                "connection reset",
            )),
            Some(CallFailure::Protocol) => Err(ToolHostError::Server {
                server: self.server.clone(),
                code: Some(-32602),
                message: format!("unknown tool: {name}"),
                data: None,
            }),
            Some(CallFailure::ToolError) => Ok(ToolCallResult {
                text_content: Some("tool failed".into()),
                content: vec![json!({"type": "text", "text": "tool failed"})],
                is_error: true,
                ..Default::default()
            }),
            None => Ok(ToolCallResult {
                structured_content: Some(json!({
                    "server": self.server,
                    "tool": name,
                    "arguments": arguments,
                })),
                ..Default::default()
            }),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out pre-built mocks keyed by endpoint path (`mock:<path>`).
#[derive(Default)]
pub(crate) struct MockFactory {
    transports: Mutex<HashMap<String, Arc<MockTransport>>>,
}

impl MockFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, path: &str, transport: MockTransport) -> Arc<MockTransport> {
        let transport = Arc::new(transport);
        self.transports
            .lock()
            .expect("factory lock")
            .insert(path.to_string(), transport.clone());
        transport
    }
}

impl TransportFactory for MockFactory {
    fn schemes(&self) -> &[&str] {
        &["mock"]
    }

    fn create(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn ToolTransport>> {
        let path = descriptor.endpoint().path();
        let transport = self
            .transports
            .lock()
            .expect("factory lock")
            .get(path)
            .cloned()
            .ok_or_else(|| {
                ToolHostError::Configuration(format!("no mock transport for '{path}'"))
            })?;
        Ok(transport)
    }
}
