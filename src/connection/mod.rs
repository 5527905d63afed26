//! Connection manager: one long-lived logical connection per server.
//!
//! Each slot moves through `Disconnected -> Connecting -> Ready`, drops to
//! `Degraded` on transport failure and is probed back to `Ready` by a single
//! background reconnect loop. Every entry into `Ready` bumps the slot's
//! generation, which is what catalog entries and handles are keyed on.

mod backoff;

pub use backoff::Backoff;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use strum::{Display, EnumString};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ConnectionConfig;
use crate::descriptor::{DescriptorStore, RejectedServer, ServerDescriptor};
use crate::error::{Result, ToolHostError};
use crate::transport::{ServerInfo, ToolTransport, TransportRegistry};

const EVENT_CAPACITY: usize = 64;

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Degraded,
    Closed,
}

/// A state transition, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub server: String,
    pub slot_id: u64,
    pub generation: u64,
    pub state: ConnectionState,
}

/// Ready connection as seen by a caller.
///
/// Holds its own reference to the transport, so in-flight work survives the
/// slot being replaced by a reload.
#[derive(Clone)]
pub struct ConnectionHandle {
    server: String,
    slot_id: u64,
    generation: u64,
    transport: Arc<dyn ToolTransport>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("server", &self.server)
            .field("slot_id", &self.slot_id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn slot_id(&self) -> u64 {
        self.slot_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn transport(&self) -> &Arc<dyn ToolTransport> {
        &self.transport
    }
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub server: String,
    pub state: ConnectionState,
    pub generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct SlotInner {
    state: ConnectionState,
    generation: u64,
    server_info: Option<ServerInfo>,
    last_error: Option<String>,
    reconnecting: bool,
}

struct ConnectionSlot {
    id: u64,
    descriptor: Arc<ServerDescriptor>,
    transport: Arc<dyn ToolTransport>,
    inner: RwLock<SlotInner>,
    changed: Notify,
    cancel: CancellationToken,
}

impl ConnectionSlot {
    fn name(&self) -> &str {
        self.descriptor.name()
    }

    fn read(&self) -> RwLockReadGuard<'_, SlotInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SlotInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, generation: u64) -> ConnectionHandle {
        ConnectionHandle {
            server: self.name().to_string(),
            slot_id: self.id,
            generation,
            transport: self.transport.clone(),
        }
    }

    fn event(&self, state: ConnectionState, generation: u64) -> ConnectionEvent {
        ConnectionEvent {
            server: self.name().to_string(),
            slot_id: self.id,
            generation,
            state,
        }
    }

    /// Enter Ready from Connecting or Degraded. Returns the new generation.
    fn mark_ready(&self, info: ServerInfo) -> Option<u64> {
        let mut inner = self.write();
        if !matches!(
            inner.state,
            ConnectionState::Connecting | ConnectionState::Degraded
        ) {
            return None;
        }
        inner.generation += 1;
        inner.state = ConnectionState::Ready;
        inner.server_info = Some(info);
        inner.last_error = None;
        inner.reconnecting = false;
        Some(inner.generation)
    }

    /// Enter Degraded from `from`. Returns whether a reconnect loop must be
    /// started, or `None` when the transition did not apply.
    fn mark_degraded(
        &self,
        from: ConnectionState,
        generation: Option<u64>,
        error: &ToolHostError,
    ) -> Option<(u64, bool)> {
        let mut inner = self.write();
        if inner.state != from || generation.is_some_and(|g| g != inner.generation) {
            return None;
        }
        inner.state = ConnectionState::Degraded;
        inner.last_error = Some(error.to_string());
        let start_loop = !inner.reconnecting;
        inner.reconnecting = true;
        Some((inner.generation, start_loop))
    }

    fn close(&self) -> Option<u64> {
        self.cancel.cancel();
        let generation = {
            let mut inner = self.write();
            if inner.state == ConnectionState::Closed {
                return None;
            }
            inner.state = ConnectionState::Closed;
            inner.generation
        };
        self.changed.notify_waiters();
        Some(generation)
    }

    fn status(&self) -> ServerStatus {
        let inner = self.read();
        ServerStatus {
            server: self.name().to_string(),
            state: inner.state,
            generation: inner.generation,
            last_error: inner.last_error.clone(),
        }
    }
}

/// Shared pieces background tasks need.
#[derive(Clone)]
struct Runtime {
    config: Arc<ConnectionConfig>,
    events: broadcast::Sender<ConnectionEvent>,
    tasks: TaskTracker,
}

impl Runtime {
    fn emit(&self, event: ConnectionEvent) {
        tracing::info!(
            server = %event.server,
            slot = event.slot_id,
            generation = event.generation,
            state = %event.state,
            "connection state changed"
        );
        let _ = self.events.send(event);
    }

    async fn handshake(&self, slot: &ConnectionSlot) -> Result<ServerInfo> {
        let limit = self.config.handshake_timeout();
        match tokio::time::timeout(limit, slot.transport.connect()).await {
            Ok(result) => result,
            Err(_) => Err(ToolHostError::Timeout(limit.as_millis() as u64)),
        }
    }

    /// First connect for a slot already marked Connecting.
    fn spawn_connect(&self, slot: Arc<ConnectionSlot>) {
        let runtime = self.clone();
        self.tasks.spawn(async move {
            let result = tokio::select! {
                _ = slot.cancel.cancelled() => return,
                result = runtime.handshake(&slot) => result,
            };
            match result {
                Ok(info) => runtime.enter_ready(&slot, info),
                Err(error) => {
                    tracing::warn!(server = %slot.name(), error = %error, "connect failed");
                    runtime.degrade(&slot, ConnectionState::Connecting, None, &error);
                }
            }
            slot.changed.notify_waiters();
        });
    }

    fn enter_ready(&self, slot: &ConnectionSlot, info: ServerInfo) {
        if let Some(generation) = slot.mark_ready(info) {
            self.emit(slot.event(ConnectionState::Ready, generation));
        }
    }

    fn degrade(
        &self,
        slot: &Arc<ConnectionSlot>,
        from: ConnectionState,
        generation: Option<u64>,
        error: &ToolHostError,
    ) {
        let Some((generation, start_loop)) = slot.mark_degraded(from, generation, error) else {
            return;
        };
        self.emit(slot.event(ConnectionState::Degraded, generation));
        if start_loop {
            self.spawn_reconnect(slot.clone());
        }
    }

    fn spawn_reconnect(&self, slot: Arc<ConnectionSlot>) {
        let runtime = self.clone();
        self.tasks.spawn(async move {
            let mut backoff = Backoff::new(&runtime.config.backoff);
            loop {
                let delay = backoff.next_delay();
                tracing::warn!(
                    server = %slot.name(),
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "server degraded, scheduling reconnect"
                );
                tokio::select! {
                    _ = slot.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                let result = tokio::select! {
                    _ = slot.cancel.cancelled() => return,
                    result = runtime.handshake(&slot) => result,
                };
                match result {
                    Ok(info) => {
                        runtime.enter_ready(&slot, info);
                        slot.changed.notify_waiters();
                        return;
                    }
                    Err(error) => {
                        tracing::debug!(server = %slot.name(), error = %error, "reconnect attempt failed");
                        slot.write().last_error = Some(error.to_string());
                    }
                }
            }
        });
    }
}

enum Next {
    Ready(ConnectionHandle),
    Fail(ToolHostError),
    Wait,
    Connect,
}

/// Owns every connection slot.
pub struct ConnectionManager {
    slots: RwLock<HashMap<String, Arc<ConnectionSlot>>>,
    registry: Arc<TransportRegistry>,
    runtime: Runtime,
    cancel: CancellationToken,
    next_slot_id: AtomicU64,
}

impl ConnectionManager {
    /// Manager with no servers; populate it with [`apply_store`](Self::apply_store).
    pub fn new(registry: Arc<TransportRegistry>, config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            slots: RwLock::new(HashMap::new()),
            registry,
            runtime: Runtime {
                config: Arc::new(config),
                events,
                tasks: TaskTracker::new(),
            },
            cancel: CancellationToken::new(),
            next_slot_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.runtime.config
    }

    fn slot(&self, name: &str) -> Option<Arc<ConnectionSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn all_slots(&self) -> Vec<Arc<ConnectionSlot>> {
        let mut slots: Vec<_> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        slots.sort_by(|a, b| a.name().cmp(b.name()));
        slots
    }

    fn new_slot(&self, descriptor: Arc<ServerDescriptor>) -> Result<Arc<ConnectionSlot>> {
        let transport = self.registry.create(&descriptor)?;
        Ok(Arc::new(ConnectionSlot {
            id: self.next_slot_id.fetch_add(1, Ordering::Relaxed),
            descriptor,
            transport,
            inner: RwLock::new(SlotInner {
                state: ConnectionState::Disconnected,
                generation: 0,
                server_info: None,
                last_error: None,
                reconnecting: false,
            }),
            changed: Notify::new(),
            cancel: self.cancel.child_token(),
        }))
    }

    /// Return a Ready handle, connecting a Disconnected server first.
    ///
    /// Degraded and Closed servers fail immediately; concurrent callers on a
    /// Connecting server share its single handshake.
    pub async fn ensure_ready(&self, name: &str) -> Result<ConnectionHandle> {
        let slot = self
            .slot(name)
            .ok_or_else(|| ToolHostError::UnknownServer(name.to_string()))?;

        loop {
            let changed = slot.changed.notified();
            let next = {
                let mut inner = slot.write();
                match inner.state {
                    ConnectionState::Ready => Next::Ready(slot.handle(inner.generation)),
                    ConnectionState::Degraded => Next::Fail(ToolHostError::connection(
                        name,
                        match &inner.last_error {
                            Some(e) => format!("server is degraded: {e}"),
                            None => "server is degraded".to_string(),
                        },
                    )),
                    ConnectionState::Closed => {
                        Next::Fail(ToolHostError::connection(name, "connection closed"))
                    }
                    ConnectionState::Connecting => Next::Wait,
                    ConnectionState::Disconnected => {
                        inner.state = ConnectionState::Connecting;
                        Next::Connect
                    }
                }
            };

            match next {
                Next::Ready(handle) => return Ok(handle),
                Next::Fail(error) => return Err(error),
                Next::Connect => {
                    tracing::debug!(server = %name, "connecting");
                    self.runtime
                        .emit(slot.event(ConnectionState::Connecting, slot.read().generation));
                    self.runtime.spawn_connect(slot.clone());
                }
                Next::Wait => {}
            }

            tokio::select! {
                _ = changed => {}
                _ = slot.cancel.cancelled() => {
                    return Err(ToolHostError::connection(name, "connection closed"));
                }
            }
        }
    }

    /// Current state without blocking or connecting.
    pub fn status(&self, name: &str) -> Option<ConnectionState> {
        self.slot(name).map(|slot| slot.read().state)
    }

    /// Status of every server, ordered by name.
    pub fn statuses(&self) -> Vec<ServerStatus> {
        self.all_slots().iter().map(|slot| slot.status()).collect()
    }

    /// Server names, ordered.
    pub fn server_names(&self) -> Vec<String> {
        self.all_slots()
            .iter()
            .map(|slot| slot.name().to_string())
            .collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<Arc<ServerDescriptor>> {
        self.slot(name).map(|slot| slot.descriptor.clone())
    }

    /// What the server reported at its last successful handshake.
    pub fn server_info(&self, name: &str) -> Option<ServerInfo> {
        self.slot(name).and_then(|slot| slot.read().server_info.clone())
    }

    /// `(slot_id, generation)` if the server is Ready.
    pub fn ready_identity(&self, name: &str) -> Option<(u64, u64)> {
        let slot = self.slot(name)?;
        let inner = slot.read();
        (inner.state == ConnectionState::Ready).then_some((slot.id, inner.generation))
    }

    /// Whether `(slot_id, generation)` still names the current Ready connection.
    pub fn is_current(&self, name: &str, slot_id: u64, generation: u64) -> bool {
        self.ready_identity(name) == Some((slot_id, generation))
    }

    /// Report a failed call. Retryable errors on the current generation move
    /// the server to Degraded and start background reconnection.
    pub fn report_failure(&self, handle: &ConnectionHandle, error: &ToolHostError) {
        if !error.is_retryable() {
            return;
        }
        let Some(slot) = self.slot(handle.server()) else {
            return;
        };
        if slot.id != handle.slot_id() {
            return;
        }
        tracing::warn!(server = %handle.server(), error = %error, "transport failure");
        self.runtime.degrade(
            &slot,
            ConnectionState::Ready,
            Some(handle.generation()),
            error,
        );
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.runtime.events.subscribe()
    }

    /// Swap in a new descriptor set.
    ///
    /// Unchanged servers keep their slot; changed servers get a fresh
    /// Disconnected slot; removed servers are closed. Servers whose transport
    /// cannot be created are returned as rejected.
    pub fn apply_store(&self, store: &DescriptorStore) -> Vec<RejectedServer> {
        let mut rejected = Vec::new();
        let mut retired = Vec::new();
        {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            let mut next = HashMap::with_capacity(store.len());

            for descriptor in store.list() {
                let name = descriptor.name().to_string();
                if let Some(existing) = slots.get(&name) {
                    if existing.descriptor.fingerprint() == descriptor.fingerprint()
                        && existing.read().state != ConnectionState::Closed
                    {
                        next.insert(name, existing.clone());
                        continue;
                    }
                }
                match self.new_slot(descriptor) {
                    Ok(slot) => {
                        next.insert(name, slot);
                    }
                    Err(error) => {
                        tracing::warn!(server = %name, error = %error, "cannot create transport");
                        rejected.push(RejectedServer { name, error });
                    }
                }
            }

            for (name, slot) in slots.drain() {
                let kept = next.get(&name).is_some_and(|s| Arc::ptr_eq(s, &slot));
                if !kept {
                    retired.push(slot);
                }
            }
            *slots = next;
        }

        for slot in retired {
            self.retire(slot);
        }
        rejected
    }

    fn retire(&self, slot: Arc<ConnectionSlot>) {
        if let Some(generation) = slot.close() {
            self.runtime.emit(slot.event(ConnectionState::Closed, generation));
        }
        // Handles still in flight keep the transport alive; it is dropped with them.
        if Arc::strong_count(&slot.transport) == 1 {
            let transport = slot.transport.clone();
            let server = slot.name().to_string();
            self.runtime.tasks.spawn(async move {
                if let Err(e) = transport.close().await {
                    tracing::debug!(server = %server, error = %e, "close failed");
                }
            });
        }
    }

    /// Connect every Disconnected server and wait for the handshakes.
    pub async fn connect_all(&self) {
        let names = self.server_names();
        let results =
            futures::future::join_all(names.iter().map(|name| self.ensure_ready(name))).await;
        for (name, result) in names.iter().zip(results) {
            if let Err(error) = result {
                tracing::warn!(server = %name, error = %error, "eager connect failed");
            }
        }
    }

    /// Close every connection and stop background work.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let slots: Vec<_> = {
            let mut map = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            map.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &slots {
            if let Some(generation) = slot.close() {
                self.runtime.emit(slot.event(ConnectionState::Closed, generation));
            }
        }
        futures::future::join_all(slots.iter().map(|slot| slot.transport.close())).await;

        self.runtime.tasks.close();
        self.runtime.tasks.wait().await;
    }
}
