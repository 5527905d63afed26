//! Shared test helpers and a scripted in-memory transport.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use roci_toolhost::config::{HostConfig, ServerEntry};
use roci_toolhost::descriptor::ServerDescriptor;
use roci_toolhost::error::{Result, ToolHostError};
use roci_toolhost::facade::SecretLookup;
use roci_toolhost::transport::{
    RemoteTool, ServerInfo, ToolCallResult, ToolTransport, TransportFactory, TransportRegistry,
};
use roci_toolhost::ToolHost;

/// A transport that answers from a script.
pub struct ScriptedServer {
    name: String,
    tools: Vec<RemoteTool>,
    instructions: Option<String>,
    call_delay: Mutex<Duration>,
    refuse_connect: AtomicBool,
    fail_calls: AtomicBool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptedServer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tools: Vec::new(),
            instructions: None,
            call_delay: Mutex::new(Duration::ZERO),
            refuse_connect: AtomicBool::new(false),
            fail_calls: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Advertise a tool requiring a string `query`.
    pub fn with_search(mut self) -> Self {
        self.tools.push(RemoteTool {
            name: "search".into(),
            description: Some("Search the index".into()),
            input_schema: json!({
                "type": "object",
                "properties": { "query": { "type": "string", "minLength": 1 } },
                "required": ["query"]
            }),
            tags: vec!["search".into()],
        });
        self
    }

    pub fn with_tool(mut self, name: &str, description: &str) -> Self {
        self.tools.push(RemoteTool {
            name: name.into(),
            description: Some(description.into()),
            input_schema: json!({ "type": "object" }),
            tags: Vec::new(),
        });
        self
    }

    pub fn with_instructions(mut self, text: &str) -> Self {
        self.instructions = Some(text.into());
        self
    }

    pub fn with_call_delay(self, delay: Duration) -> Self {
        *self.call_delay.lock().unwrap() = delay;
        self
    }

    pub fn refusing_connections(self) -> Self {
        self.refuse_connect.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_refusing(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    pub fn set_fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct Active<'a>(&'a AtomicUsize);

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ToolTransport for ScriptedServer {
    async fn connect(&self) -> Result<ServerInfo> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(ToolHostError::connection(&self.name, "connection refused"));
        }
        self.closed.store(false, Ordering::SeqCst);
        Ok(ServerInfo {
            name: Some(self.name.clone()),
            version: Some("1.0.0".into()),
            instructions: self.instructions.clone(),
            protocol_version: "2025-03-26".into(),
        })
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _active = Active(&self.in_flight);

        let delay = *self.call_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(ToolHostError::connection(&self.name, "connection reset"));
        }
        Ok(ToolCallResult {
            text_content: Some(format!("{}:{name}:{arguments}", self.name)),
            ..Default::default()
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Serves `scripted:<key>` endpoints from a fixed table.
#[derive(Default)]
pub struct ScriptedFactory {
    servers: Mutex<HashMap<String, Arc<ScriptedServer>>>,
}

impl ScriptedFactory {
    pub fn add(&self, key: &str, server: ScriptedServer) -> Arc<ScriptedServer> {
        let server = Arc::new(server);
        self.servers
            .lock()
            .unwrap()
            .insert(key.to_string(), server.clone());
        server
    }
}

impl TransportFactory for ScriptedFactory {
    fn schemes(&self) -> &[&str] {
        &["scripted"]
    }

    fn create(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn ToolTransport>> {
        let key = descriptor.endpoint().path();
        let server = self.servers.lock().unwrap().get(key).cloned().ok_or_else(|| {
            ToolHostError::Configuration(format!("no scripted server '{key}'"))
        })?;
        Ok(server)
    }
}

/// Enabled config with one `scripted:<name>` entry per name.
pub fn config_for(names: &[&str]) -> HostConfig {
    names.iter().fold(
        HostConfig {
            enabled: true,
            ..HostConfig::default()
        },
        |config, name| config.with_server(*name, ServerEntry::new(format!("scripted:{name}"))),
    )
}

pub fn no_secrets() -> SecretLookup {
    Arc::new(|_: &str| -> Option<String> { None })
}

/// Build a host over `factory` with the given config.
pub fn build_host(config: HostConfig, factory: Arc<ScriptedFactory>) -> ToolHost {
    let registry = Arc::new(TransportRegistry::new().with_factory(factory));
    ToolHost::from_config_with_lookup(config, registry, no_secrets())
        .expect("config should be valid")
        .expect("host should be enabled")
}
