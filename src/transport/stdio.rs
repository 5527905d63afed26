//! Stdio transport for local capability servers, driven by `rmcp`.
//!
//! Endpoint form: `stdio:<command>?arg=<a>&arg=<b>`. Descriptor headers are
//! passed to the child process as environment variables.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, ClientInfo, JsonObject, ProtocolVersion};
use rmcp::service::{
    ClientInitializeError, DynService, Peer, RoleClient, RunningService, ServiceError, ServiceExt,
};
use rmcp::transport::TokioChildProcess;
use serde_json::Value;
use tokio::process::Command;

use super::{RemoteTool, ServerInfo, ToolCallResult, ToolTransport, TransportFactory};
use crate::descriptor::ServerDescriptor;
use crate::error::{Result, ToolHostError};

type DynClientService = Box<dyn DynService<RoleClient>>;
type ClientSession = RunningService<RoleClient, DynClientService>;

/// Child-process transport.
pub struct StdioTransport {
    server: String,
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    session: Mutex<Option<ClientSession>>,
    peer: Mutex<Option<Peer<RoleClient>>>,
}

impl StdioTransport {
    pub fn new(descriptor: &ServerDescriptor) -> Result<Self> {
        let endpoint = descriptor.endpoint();
        let command = endpoint.path().trim().to_string();
        if command.is_empty() {
            return Err(ToolHostError::Configuration(format!(
                "server '{}': stdio endpoint needs a command",
                descriptor.name()
            )));
        }
        let args = endpoint
            .query_pairs()
            .filter(|(key, _)| key == "arg")
            .map(|(_, value)| value.into_owned())
            .collect();

        Ok(Self {
            server: descriptor.name().to_string(),
            command,
            args,
            env: descriptor.headers().to_vec(),
            session: Mutex::new(None),
            peer: Mutex::new(None),
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn peer(&self) -> Result<Peer<RoleClient>> {
        self.peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| ToolHostError::connection(self.server.clone(), "not connected"))
    }

    async fn spawn(
        &self,
        protocol_version: ProtocolVersion,
    ) -> std::result::Result<ClientSession, ClientInitializeError> {
        let mut command = Command::new(&self.command);
        command.args(&self.args);
        command.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let transport = TokioChildProcess::new(command).map_err(|error| {
            ClientInitializeError::transport::<TokioChildProcess>(error, "spawn stdio transport")
        })?;

        let client_info = ClientInfo {
            protocol_version,
            ..Default::default()
        };
        client_info.into_dyn().serve(transport).await
    }

    async fn take_and_cancel(&self) {
        let previous = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner) = None;
        if let Some(session) = previous {
            if let Err(e) = session.cancel().await {
                tracing::debug!(server = %self.server, error = %e, "stdio session shutdown failed");
            }
        }
    }
}

fn should_retry_protocol_fallback(error: &ClientInitializeError) -> bool {
    match error {
        ClientInitializeError::JsonRpcError(error) => {
            let message = error.message.to_ascii_lowercase();
            message.contains("protocol") && message.contains("version")
        }
        _ => false,
    }
}

fn map_initialize_error(server: &str, error: ClientInitializeError) -> ToolHostError {
    match error {
        ClientInitializeError::JsonRpcError(error) => ToolHostError::Server {
            server: server.to_string(),
            code: Some(i64::from(error.code.0)),
            message: error.message.to_string(),
            data: error.data,
        },
        other => ToolHostError::connection(server, format!("initialize failed: {other}")),
    }
}

fn map_service_error(server: &str, context: &str, error: ServiceError) -> ToolHostError {
    match error {
        ServiceError::McpError(error) => ToolHostError::Server {
            server: server.to_string(),
            code: Some(i64::from(error.code.0)),
            message: format!("{context}: {}", error.message),
            data: error.data,
        },
        ServiceError::Timeout { timeout } => ToolHostError::Timeout(timeout.as_millis() as u64),
        other => ToolHostError::connection(server, format!("{context}: {other}")),
    }
}

fn coerce_arguments(arguments: Value) -> Result<Option<JsonObject>> {
    match arguments {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        other => Err(ToolHostError::InvalidRequest(format!(
            "tool arguments must be a JSON object; got {other}"
        ))),
    }
}

#[async_trait]
impl ToolTransport for StdioTransport {
    async fn connect(&self) -> Result<ServerInfo> {
        self.take_and_cancel().await;

        let session = match self.spawn(ProtocolVersion::LATEST).await {
            Ok(session) => session,
            Err(error) if should_retry_protocol_fallback(&error) => self
                .spawn(ProtocolVersion::V_2024_11_05)
                .await
                .map_err(|e| map_initialize_error(&self.server, e))?,
            Err(error) => return Err(map_initialize_error(&self.server, error)),
        };

        let info = session
            .peer_info()
            .map(|info| ServerInfo {
                name: Some(info.server_info.name.clone()),
                version: Some(info.server_info.version.clone()),
                instructions: info.instructions.clone(),
                protocol_version: info.protocol_version.to_string(),
            })
            .unwrap_or_default();

        *self.peer.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.peer().clone());
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
        Ok(info)
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>> {
        let peer = self.peer()?;
        let tools = match peer.list_all_tools().await {
            Ok(tools) => tools,
            Err(ServiceError::UnexpectedResponse) => peer
                .list_tools(None)
                .await
                .map(|page| page.tools)
                .map_err(|e| map_service_error(&self.server, "tools/list", e))?,
            Err(error) => return Err(map_service_error(&self.server, "tools/list", error)),
        };

        Ok(tools
            .into_iter()
            .filter_map(|tool| serde_json::to_value(tool).ok())
            .filter_map(|raw| RemoteTool::from_wire(&raw))
            .collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        let arguments = coerce_arguments(arguments)?;
        let peer = self.peer()?;
        let result = peer
            .call_tool(CallToolRequestParams {
                meta: None,
                name: name.to_owned().into(),
                arguments,
                task: None,
            })
            .await
            .map_err(|e| map_service_error(&self.server, "tools/call", e))?;

        let raw = serde_json::to_value(result)?;
        Ok(ToolCallResult::from_wire(&raw))
    }

    async fn close(&self) -> Result<()> {
        self.take_and_cancel().await;
        Ok(())
    }
}

/// Factory for `stdio:` endpoints.
pub struct StdioTransportFactory;

impl TransportFactory for StdioTransportFactory {
    fn schemes(&self) -> &[&str] {
        &["stdio"]
    }

    fn create(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn ToolTransport>> {
        Ok(Arc::new(StdioTransport::new(descriptor)?))
    }
}
