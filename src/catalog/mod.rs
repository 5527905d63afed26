//! Capability catalog: per-server tool schemas, cached against the
//! connection identity they were listed on.

mod search;

pub use search::SearchQuery;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{Result, ToolHostError};
use crate::transport::RemoteTool;

/// One tool offered by one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSchema {
    #[serde(rename = "server")]
    pub owning_server: String,
    #[serde(rename = "tool")]
    pub tool_name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ToolSchema {
    fn from_remote(server: &str, tool: RemoteTool) -> Self {
        Self {
            owning_server: server.to_string(),
            tool_name: tool.name,
            description: tool.description.unwrap_or_default(),
            input_schema: tool.input_schema,
            tags: tool.tags,
        }
    }

    /// `server.tool`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.owning_server, self.tool_name)
    }
}

struct CachedTools {
    slot_id: u64,
    generation: u64,
    tools: Vec<Arc<ToolSchema>>,
}

type CatalogEntry = RwLock<Option<CachedTools>>;

/// Tool schemas for every configured server.
pub struct Catalog {
    connections: Arc<ConnectionManager>,
    entries: RwLock<HashMap<String, Arc<CatalogEntry>>>,
}

impl Catalog {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    fn entry(&self, server: &str) -> Arc<CatalogEntry> {
        if let Some(entry) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server)
        {
            return entry.clone();
        }
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(server.to_string())
            .or_default()
            .clone()
    }

    /// Tools for `server`, only while the connection they were listed on is
    /// still the current Ready one.
    fn current_tools(&self, server: &str) -> Option<Vec<Arc<ToolSchema>>> {
        let entry = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server)
            .cloned()?;
        let cached = entry.read().unwrap_or_else(PoisonError::into_inner);
        let cached = cached.as_ref()?;
        self.connections
            .is_current(server, cached.slot_id, cached.generation)
            .then(|| cached.tools.clone())
    }

    /// Whether `server` has tools cached for its current connection.
    pub fn is_synced(&self, server: &str) -> bool {
        self.current_tools(server).is_some()
    }

    /// List `server`'s tools and replace its cache. Returns the tool count.
    pub async fn sync_server(&self, server: &str) -> Result<usize> {
        let handle = self.connections.ensure_ready(server).await?;
        let limit = self.connections.config().handshake_timeout();
        let listed = match tokio::time::timeout(limit, handle.transport().list_tools()).await {
            Ok(result) => result,
            Err(_) => Err(ToolHostError::Timeout(limit.as_millis() as u64)),
        };
        let remote = match listed {
            Ok(tools) => tools,
            Err(error) => {
                self.connections.report_failure(&handle, &error);
                return Err(error);
            }
        };

        let mut seen = HashSet::new();
        let mut tools = Vec::with_capacity(remote.len());
        for tool in remote {
            if !seen.insert(tool.name.clone()) {
                tracing::warn!(server, tool = %tool.name, "duplicate tool name, keeping the first");
                continue;
            }
            tools.push(Arc::new(ToolSchema::from_remote(server, tool)));
        }
        tools.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
        let count = tools.len();

        let entry = self.entry(server);
        let mut cached = entry.write().unwrap_or_else(PoisonError::into_inner);
        if !self
            .connections
            .is_current(server, handle.slot_id(), handle.generation())
        {
            tracing::debug!(server, "connection changed during sync, discarding listing");
            return Err(ToolHostError::connection(server, "connection changed during sync"));
        }
        *cached = Some(CachedTools {
            slot_id: handle.slot_id(),
            generation: handle.generation(),
            tools,
        });
        tracing::debug!(server, tools = count, generation = handle.generation(), "catalog synced");
        Ok(count)
    }

    /// Connect never-used servers and sync every Ready server without a
    /// current listing. Degraded servers are skipped.
    pub async fn ensure_synced(&self) {
        let pending: Vec<String> = self
            .connections
            .server_names()
            .into_iter()
            .filter(|name| match self.connections.status(name) {
                Some(ConnectionState::Disconnected | ConnectionState::Connecting) => true,
                Some(ConnectionState::Ready) => !self.is_synced(name),
                _ => false,
            })
            .collect();

        let results =
            futures::future::join_all(pending.iter().map(|name| self.sync_server(name))).await;
        for (name, result) in pending.iter().zip(results) {
            if let Err(error) = result {
                tracing::warn!(server = %name, error = %error, "catalog sync failed");
            }
        }
    }

    /// Re-list every Ready server.
    pub async fn refresh_ready(&self) {
        let ready: Vec<String> = self
            .connections
            .server_names()
            .into_iter()
            .filter(|name| self.connections.status(name) == Some(ConnectionState::Ready))
            .collect();
        let results =
            futures::future::join_all(ready.iter().map(|name| self.sync_server(name))).await;
        for (name, result) in ready.iter().zip(results) {
            if let Err(error) = result {
                tracing::warn!(server = %name, error = %error, "catalog refresh failed");
            }
        }
    }

    /// Every current tool, ordered by server then tool name.
    pub fn all(&self) -> Vec<ToolSchema> {
        self.connections
            .server_names()
            .iter()
            .filter_map(|server| self.current_tools(server))
            .flatten()
            .map(|tool| (*tool).clone())
            .collect()
    }

    /// Ranked search over current tools.
    pub fn search(&self, query: &SearchQuery) -> Vec<ToolSchema> {
        let mut snapshot = Vec::new();
        for server in self.connections.server_names() {
            let Some(tools) = self.current_tools(&server) else {
                continue;
            };
            let server_text = self.server_text(&server);
            snapshot.extend(tools.into_iter().map(|tool| (tool, server_text.clone())));
        }

        let candidates = snapshot
            .iter()
            .map(|(tool, server_text)| search::Candidate {
                schema: tool.as_ref(),
                server_text: server_text.clone(),
            })
            .collect();
        search::rank(candidates, query)
    }

    fn server_text(&self, server: &str) -> String {
        let mut text = self
            .connections
            .descriptor(server)
            .map(|d| d.instruction().to_lowercase())
            .unwrap_or_default();
        if let Some(instructions) = self
            .connections
            .server_info(server)
            .and_then(|info| info.instructions)
        {
            text.push('\n');
            text.push_str(&instructions.to_lowercase());
        }
        text
    }

    /// Every Ready provider of `tool_name`, ordered by server name.
    pub fn resolve(&self, tool_name: &str) -> Vec<ToolSchema> {
        self.connections
            .server_names()
            .iter()
            .filter_map(|server| {
                self.current_tools(server)?
                    .into_iter()
                    .find(|tool| tool.tool_name == tool_name)
            })
            .map(|tool| (*tool).clone())
            .collect()
    }

    /// Drop entries for servers that are no longer configured.
    pub fn prune(&self) {
        let live: HashSet<String> = self.connections.server_names().into_iter().collect();
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|server, _| live.contains(server));
    }

    /// Keep the catalog fresh in the background: re-list a server as soon as
    /// it (re)enters Ready, and every Ready server on each `interval` tick.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        interval: Option<Duration>,
        tasks: &TaskTracker,
        cancel: CancellationToken,
    ) {
        let catalog = self.clone();
        let mut events = self.connections.subscribe();
        let mut ticker = interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) if event.state == ConnectionState::Ready => {
                            if catalog.is_synced(&event.server) {
                                continue;
                            }
                            if let Err(error) = catalog.sync_server(&event.server).await {
                                tracing::warn!(
                                    server = %event.server,
                                    error = %error,
                                    "resync after reconnect failed"
                                );
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "connection events lagged, refreshing all");
                            catalog.refresh_ready().await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = tick(&mut ticker) => catalog.refresh_ready().await,
                }
            }
        });
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
