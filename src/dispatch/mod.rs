//! Dispatcher: concurrent fan-out of one request to every selected provider.
//!
//! Each target runs in its own task with its own deadline. A shared semaphore
//! caps in-flight remote calls across all requests. Dropping the dispatch
//! future cancels every task it spawned.

mod outcome;
mod request;

pub use outcome::{InvocationOutcome, OutcomeStatus};
pub use request::{InvocationRequest, TargetSelection};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Catalog, ToolSchema};
use crate::config::DispatchConfig;
use crate::connection::ConnectionManager;
use crate::error::{Result, ToolHostError};
use crate::validation::validate_arguments;

/// Routes requests to providers and collects one outcome per target.
pub struct Dispatcher {
    catalog: Arc<Catalog>,
    permits: Arc<Semaphore>,
    config: DispatchConfig,
}

struct Call {
    server: String,
    tool: String,
    arguments: Value,
}

impl Dispatcher {
    pub fn new(catalog: Arc<Catalog>, config: DispatchConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
            catalog,
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Permits not currently held by an in-flight call.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Providers for `request`: explicit targets intersected with the Ready
    /// providers, or every Ready provider.
    pub fn select_targets(&self, request: &InvocationRequest) -> Result<Vec<ToolSchema>> {
        let providers = self.catalog.resolve(&request.tool_name);
        let targets = if request.target_servers.is_empty() {
            providers
        } else {
            let connections = self.catalog.connections();
            let wanted: BTreeSet<&str> = request
                .target_servers
                .iter()
                .map(|s| s.trim())
                .collect();
            if let Some(unknown) = wanted
                .iter()
                .find(|name| connections.descriptor(name).is_none())
            {
                return Err(ToolHostError::UnknownServer((*unknown).to_string()));
            }
            providers
                .into_iter()
                .filter(|p| wanted.contains(p.owning_server.as_str()))
                .collect()
        };

        if targets.is_empty() {
            return Err(ToolHostError::NoMatchingServer {
                tool_name: request.tool_name.clone(),
            });
        }
        Ok(targets)
    }

    /// Run `request` to completion.
    ///
    /// Routing errors are returned as `Err`; everything that happens at a
    /// server is an outcome. Cancelling `cancel` (or the request deadline
    /// expiring) turns every pending call into a `Cancelled` outcome.
    pub async fn dispatch(
        &self,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<InvocationOutcome>> {
        request.check()?;
        let targets = self.select_targets(request)?;
        let tool = request.tool_name.as_str();

        let mut outcomes = Vec::with_capacity(targets.len());
        let mut calls = Vec::new();
        for target in &targets {
            if request.selection == TargetSelection::FirstAvailable && !calls.is_empty() {
                break;
            }
            match validate_arguments(&request.arguments, &target.input_schema) {
                Ok(()) => calls.push(Call {
                    server: target.owning_server.clone(),
                    tool: tool.to_string(),
                    arguments: request.arguments.clone(),
                }),
                Err(error) => outcomes.push(InvocationOutcome::failed(
                    &target.owning_server,
                    tool,
                    OutcomeStatus::ValidationError,
                    error.to_string(),
                    Duration::ZERO,
                    false,
                )),
            }
        }
        if request.selection == TargetSelection::FirstAvailable && !calls.is_empty() {
            outcomes.clear();
        }

        tracing::debug!(
            request_id = %request.request_id,
            tool,
            targets = targets.len(),
            dispatched = calls.len(),
            "dispatching"
        );
        if calls.is_empty() {
            return Ok(outcomes);
        }

        let call_cancel = cancel.child_token();
        let _guard = call_cancel.clone().drop_guard();

        let mut servers = Vec::with_capacity(calls.len());
        let mut handles = Vec::with_capacity(calls.len());
        for call in calls {
            servers.push(call.server.clone());
            handles.push(tokio::spawn(run_call(
                self.catalog.connections().clone(),
                self.permits.clone(),
                self.config.call_timeout(),
                call,
                call_cancel.clone(),
            )));
        }

        let joined = futures::future::join_all(handles);
        let results = match request.timeout.or(self.config.request_timeout()) {
            Some(deadline) => {
                tokio::pin!(joined);
                tokio::select! {
                    results = &mut joined => results,
                    _ = tokio::time::sleep(deadline) => {
                        tracing::debug!(request_id = %request.request_id, "request deadline reached");
                        call_cancel.cancel();
                        joined.await
                    }
                }
            }
            None => joined.await,
        };

        for (server, result) in servers.iter().zip(results) {
            outcomes.push(match result {
                Ok(outcome) => outcome,
                Err(error) => InvocationOutcome::failed(
                    server,
                    tool,
                    OutcomeStatus::TransportError,
                    format!("call task failed: {error}"),
                    Duration::ZERO,
                    true,
                ),
            });
        }
        Ok(outcomes)
    }
}

async fn run_call(
    connections: Arc<ConnectionManager>,
    permits: Arc<Semaphore>,
    call_timeout: Duration,
    call: Call,
    cancel: CancellationToken,
) -> InvocationOutcome {
    let Call {
        server,
        tool,
        arguments,
    } = call;
    let queued = Instant::now();
    let cancelled = |since: Instant, dispatched: bool| {
        InvocationOutcome::failed(
            &server,
            &tool,
            OutcomeStatus::Cancelled,
            "request cancelled",
            since.elapsed(),
            dispatched,
        )
    };

    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return cancelled(queued, false),
        permit = permits.acquire_owned() => permit,
    };
    let Ok(_permit) = permit else {
        return InvocationOutcome::failed(
            &server,
            &tool,
            OutcomeStatus::TransportError,
            "dispatcher is shut down",
            queued.elapsed(),
            false,
        );
    };

    let handle = tokio::select! {
        biased;
        _ = cancel.cancelled() => return cancelled(queued, false),
        handle = connections.ensure_ready(&server) => handle,
    };
    let handle = match handle {
        Ok(handle) => handle,
        Err(error) => {
            return InvocationOutcome::failed(
                &server,
                &tool,
                OutcomeStatus::TransportError,
                error.to_string(),
                queued.elapsed(),
                false,
            )
        }
    };

    let started = Instant::now();
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return cancelled(started, true),
        result = tokio::time::timeout(call_timeout, handle.transport().call_tool(&tool, arguments)) => result,
    };
    let latency = started.elapsed();

    match result {
        Err(_) => {
            tracing::debug!(server = %server, tool = %tool, "call timed out");
            InvocationOutcome::failed(
                &server,
                &tool,
                OutcomeStatus::Timeout,
                format!("no response within {}ms", call_timeout.as_millis()),
                latency,
                true,
            )
        }
        Ok(Ok(result)) if result.is_error => InvocationOutcome::failed(
            &server,
            &tool,
            OutcomeStatus::ServerError,
            result.error_message(),
            latency,
            true,
        ),
        Ok(Ok(result)) => InvocationOutcome::ok(&server, &tool, result.into_value_or_text(), latency),
        Ok(Err(error @ ToolHostError::Server { .. })) => InvocationOutcome::failed(
            &server,
            &tool,
            OutcomeStatus::ServerError,
            error.to_string(),
            latency,
            true,
        ),
        Ok(Err(error)) => {
            connections.report_failure(&handle, &error);
            InvocationOutcome::failed(
                &server,
                &tool,
                OutcomeStatus::TransportError,
                error.to_string(),
                latency,
                true,
            )
        }
    }
}
