//! The single tool the agent sees.
//!
//! [`ToolHost`] owns one [`HostContext`] and exposes discovery and invocation
//! over every configured server. Connections, transports and per-server
//! failures stay behind it: callers get schemas, aggregated responses, or one
//! of the request-level errors (`InvalidRequest`, `NoMatchingServer`,
//! `UnknownServer`, or `Cancelled` when a request is cancelled before any
//! server could be routed).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::aggregate::AggregatedResponse;
use crate::catalog::{Catalog, SearchQuery, ToolSchema};
use crate::config::HostConfig;
use crate::connection::{ConnectionManager, ServerStatus};
use crate::descriptor::{secrets, DescriptorStore, RejectedServer, ServerDescriptor};
use crate::dispatch::{Dispatcher, InvocationRequest, TargetSelection};
use crate::error::{Result, ToolHostError};
use crate::instructions::{collect_sources, render_instruction_block};
use crate::transport::TransportRegistry;
use crate::validation::validate_arguments;

/// Name of the one tool registered with the agent.
pub const TOOL_NAME: &str = "mcp_tools";

/// Resolves secret placeholders in descriptor headers.
pub type SecretLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Tool definition handed to the agent runtime.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Everything one host owns. Several hosts can coexist in a process.
pub struct HostContext {
    store: RwLock<Arc<DescriptorStore>>,
    connections: Arc<ConnectionManager>,
    catalog: Arc<Catalog>,
    dispatcher: Dispatcher,
    config: HostConfig,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl HostContext {
    pub fn new(config: HostConfig, registry: Arc<TransportRegistry>) -> Self {
        let connections = Arc::new(ConnectionManager::new(
            registry,
            config.connections.clone(),
        ));
        let catalog = Arc::new(Catalog::new(connections.clone()));
        let dispatcher = Dispatcher::new(catalog.clone(), config.dispatch.clone());
        Self {
            store: RwLock::new(Arc::new(DescriptorStore::default())),
            connections,
            catalog,
            dispatcher,
            config,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<DescriptorStore> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install `store` and reconcile connections with it.
    fn apply(&self, store: DescriptorStore) -> Vec<RejectedServer> {
        let rejected = self.connections.apply_store(&store);
        self.catalog.prune();
        *self.store.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(store);
        rejected
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Arguments of the single agent-facing tool.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ToolCall {
    Discover {
        #[serde(default)]
        query: Option<String>,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        limit: Option<usize>,
    },
    Invoke {
        tool_name: String,
        #[serde(default)]
        arguments: Value,
        #[serde(default)]
        target_servers: Vec<String>,
        #[serde(default)]
        selection: TargetSelection,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

/// Unified tool facade.
pub struct ToolHost {
    context: HostContext,
    lookup: SecretLookup,
    rejected: RwLock<Vec<String>>,
    started: AtomicBool,
}

impl ToolHost {
    /// Build a host from config, resolving secrets from the environment.
    ///
    /// Returns `Ok(None)` when the host is disabled or has no servers.
    pub fn from_config(
        config: HostConfig,
        registry: Arc<TransportRegistry>,
    ) -> Result<Option<Self>> {
        Self::from_config_with_lookup(config, registry, Arc::new(secrets::env_lookup))
    }

    pub fn from_config_with_lookup(
        config: HostConfig,
        registry: Arc<TransportRegistry>,
        lookup: SecretLookup,
    ) -> Result<Option<Self>> {
        if !config.enabled {
            tracing::warn!("tool host is disabled, not starting");
            return Ok(None);
        }
        config.validate()?;
        if config.servers.is_empty() {
            tracing::warn!("tool host is enabled but no servers are configured");
            return Ok(None);
        }

        let load = DescriptorStore::load(&config, lookup.as_ref());
        let context = HostContext::new(config, registry);
        let mut rejected = load.rejected;
        rejected.extend(context.apply(load.store));
        if context.connections.server_names().is_empty() {
            tracing::warn!(rejected = rejected.len(), "no usable tool servers");
        }

        Ok(Some(Self {
            context,
            lookup,
            rejected: RwLock::new(rejected.into_iter().map(|r| r.name).collect()),
            started: AtomicBool::new(false),
        }))
    }

    pub fn context(&self) -> &HostContext {
        &self.context
    }

    /// Start background catalog refresh and, when configured, connect every
    /// server now. Calling it again does nothing.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let ctx = &self.context;
        ctx.catalog.spawn_refresh(
            ctx.config.catalog.refresh_interval(),
            &ctx.tasks,
            ctx.cancel.child_token(),
        );
        if ctx.config.connections.connect_eagerly {
            ctx.catalog.ensure_synced().await;
        }
        tracing::info!(servers = ctx.connections.server_names().len(), "tool host started");
    }

    /// Ranked tools across every Ready server. Never-connected servers are
    /// connected and listed first.
    pub async fn discover(&self, query: &SearchQuery) -> Vec<ToolSchema> {
        self.context.catalog.ensure_synced().await;
        self.context.catalog.search(query)
    }

    /// Run one request against every selected provider.
    pub async fn invoke(&self, request: InvocationRequest) -> Result<AggregatedResponse> {
        self.invoke_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Like [`invoke`](Self::invoke); cancelling `cancel` turns pending calls
    /// into `Cancelled` outcomes and keeps completed ones.
    ///
    /// Servers still connecting when the request is cancelled are skipped.
    /// If nothing could be routed by then, the result is
    /// [`ToolHostError::Cancelled`].
    pub async fn invoke_with_cancel(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<AggregatedResponse> {
        let ctx = &self.context;
        if ctx.cancel.is_cancelled() {
            return Err(ToolHostError::InvalidState("tool host is shut down".into()));
        }
        request.check()?;
        let started_at = Utc::now();

        // The caller token and the request deadline cover lazy connection
        // and listing as well as the calls themselves.
        let linked = ctx.cancel.child_token();
        let _guard = linked.clone().drop_guard();
        let deadline = request
            .timeout
            .or(ctx.dispatcher.config().request_timeout());
        let caller = cancel.clone();
        let forward = linked.clone();
        let watch = async move {
            match deadline {
                Some(deadline) => tokio::select! {
                    _ = caller.cancelled() => {}
                    _ = tokio::time::sleep(deadline) => {}
                },
                None => caller.cancelled().await,
            }
            forward.cancel();
        };

        let work = async {
            let interrupted = tokio::select! {
                biased;
                _ = linked.cancelled() => true,
                _ = ctx.catalog.ensure_synced() => false,
            };
            if interrupted {
                tracing::debug!(
                    request_id = %request.request_id,
                    "cancelled while syncing servers, routing on the current catalog"
                );
            }
            match ctx.dispatcher.dispatch(&request, &linked).await {
                Err(ToolHostError::NoMatchingServer { .. }) if interrupted => {
                    Err(ToolHostError::Cancelled)
                }
                other => other,
            }
        };
        tokio::pin!(work);
        let outcomes = tokio::select! {
            outcomes = &mut work => outcomes,
            _ = watch => work.await,
        }?;

        let response =
            AggregatedResponse::new(request.request_id, &request.tool_name, outcomes, started_at);
        tracing::info!(
            request_id = %request.request_id,
            tool = %request.tool_name,
            status = %response.overall_status,
            outcomes = response.outcomes.len(),
            "invocation complete"
        );
        Ok(response)
    }

    /// The single tool definition the agent registers.
    pub fn tool_definition(&self) -> ToolDefinition {
        let mut description = String::from(
            "Access every connected tool server through one tool. \
             Use op=discover to search available tools and op=invoke to call \
             a tool on every server that provides it.",
        );

        let tools = self.context.catalog.all();
        if tools.is_empty() {
            description.push_str("\n\nNo tools are available yet.");
        } else {
            description.push_str("\n\nAvailable tools:");
            for tool in &tools {
                let summary = tool.description.split_whitespace().collect::<Vec<_>>().join(" ");
                description.push_str(&format!("\n- {}: {summary}", tool.qualified_name()));
            }
        }
        if let Some(block) = self.instructions() {
            description.push_str("\n\n");
            description.push_str(&block);
        }

        ToolDefinition {
            name: TOOL_NAME.to_string(),
            description,
            parameters: call_schema(),
        }
    }

    /// Handle a call of the agent-facing tool and return its JSON result.
    pub async fn handle_tool_call(&self, arguments: Value) -> Result<Value> {
        validate_arguments(&arguments, &call_schema())
            .map_err(|e| ToolHostError::InvalidRequest(format!("{TOOL_NAME}: {e}")))?;
        let call: ToolCall = serde_json::from_value(arguments)
            .map_err(|e| ToolHostError::InvalidRequest(format!("{TOOL_NAME}: {e}")))?;

        match call {
            ToolCall::Discover { query, tags, limit } => {
                let mut search = SearchQuery {
                    text: query,
                    ..SearchQuery::default()
                }
                .with_tags(tags);
                search.limit = limit;
                let tools = self.discover(&search).await;
                Ok(json!({
                    "tools": tools
                        .iter()
                        .map(|t| json!({
                            "id": t.qualified_name(),
                            "server": t.owning_server,
                            "tool": t.tool_name,
                            "description": t.description,
                            "input_schema": t.input_schema,
                        }))
                        .collect::<Vec<_>>(),
                }))
            }
            ToolCall::Invoke {
                tool_name,
                arguments,
                target_servers,
                selection,
                timeout_ms,
            } => {
                let request = InvocationRequest::builder()
                    .tool_name(tool_name)
                    .arguments(arguments)
                    .target_servers(target_servers)
                    .selection(selection)
                    .maybe_timeout(timeout_ms.map(Duration::from_millis))
                    .build();
                Ok(self.invoke(request).await?.to_agent_value())
            }
        }
    }

    /// Per-server instruction block, or `None` when no server has any.
    pub fn instructions(&self) -> Option<String> {
        render_instruction_block(&collect_sources(&self.context.connections))
    }

    /// Swap in a new server set without interrupting in-flight requests.
    ///
    /// Unchanged servers keep their connection, changed ones reconnect on
    /// next use, removed ones are closed. Dispatch and connection settings
    /// are fixed at construction. Returns the servers that were rejected.
    pub async fn reload(&self, config: HostConfig) -> Result<Vec<RejectedServer>> {
        if !config.enabled {
            return Err(ToolHostError::Disabled);
        }
        config.validate()?;
        let ctx = &self.context;
        if ctx.cancel.is_cancelled() {
            return Err(ToolHostError::InvalidState("tool host is shut down".into()));
        }

        let load = DescriptorStore::load(&config, self.lookup.as_ref());
        let mut rejected = load.rejected;
        rejected.extend(ctx.apply(load.store));
        *self.rejected.write().unwrap_or_else(PoisonError::into_inner) =
            rejected.iter().map(|r| r.name.clone()).collect();
        tracing::info!(
            servers = ctx.connections.server_names().len(),
            rejected = rejected.len(),
            "tool host reloaded"
        );

        if ctx.config.connections.connect_eagerly {
            ctx.catalog.ensure_synced().await;
        }
        Ok(rejected)
    }

    /// Names of servers whose descriptors failed to load on the last
    /// construction or reload.
    pub fn rejected_servers(&self) -> Vec<String> {
        self.rejected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn descriptors(&self) -> Vec<Arc<ServerDescriptor>> {
        self.context.store().list()
    }

    pub fn status(&self, name: &str) -> Option<ServerStatus> {
        self.context
            .connections
            .statuses()
            .into_iter()
            .find(|status| status.server == name)
    }

    pub fn statuses(&self) -> Vec<ServerStatus> {
        self.context.connections.statuses()
    }

    /// Close every connection and wait for background work to stop.
    pub async fn shutdown(&self) {
        let ctx = &self.context;
        ctx.cancel.cancel();
        ctx.connections.shutdown().await;
        ctx.tasks.close();
        ctx.tasks.wait().await;
        tracing::info!("tool host shut down");
    }
}

fn call_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "op": {
                "type": "string",
                "enum": ["discover", "invoke"],
                "description": "discover searches the tool catalog; invoke calls a tool"
            },
            "query": { "type": "string", "description": "Free-text search (discover)" },
            "tags": { "type": "array", "items": { "type": "string" } },
            "limit": { "type": "integer", "minimum": 1 },
            "tool_name": { "type": "string", "description": "Tool to call (invoke)" },
            "arguments": { "type": "object", "description": "Tool arguments (invoke)" },
            "target_servers": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Restrict the call to these servers"
            },
            "selection": { "type": "string", "enum": ["fan_out", "first_available"] },
            "timeout_ms": { "type": "integer", "minimum": 1 }
        },
        "required": ["op"],
        "additionalProperties": false
    })
}
