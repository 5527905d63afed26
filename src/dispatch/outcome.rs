//! Per-server invocation outcomes.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutcomeStatus {
    Ok,
    ValidationError,
    Timeout,
    TransportError,
    ServerError,
    Cancelled,
}

/// What happened at one server.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationOutcome {
    pub server_name: String,
    pub tool_name: String,
    pub status: OutcomeStatus,
    pub payload: Option<Value>,
    pub error_detail: Option<String>,
    pub latency: Duration,
    /// False when the call never left the host.
    pub dispatched: bool,
}

impl InvocationOutcome {
    pub fn ok(server: &str, tool: &str, payload: Value, latency: Duration) -> Self {
        Self {
            server_name: server.to_string(),
            tool_name: tool.to_string(),
            status: OutcomeStatus::Ok,
            payload: Some(payload),
            error_detail: None,
            latency,
            dispatched: true,
        }
    }

    pub fn failed(
        server: &str,
        tool: &str,
        status: OutcomeStatus,
        detail: impl Into<String>,
        latency: Duration,
        dispatched: bool,
    ) -> Self {
        Self {
            server_name: server.to_string(),
            tool_name: tool.to_string(),
            status,
            payload: None,
            error_detail: Some(detail.into()),
            latency,
            dispatched,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == OutcomeStatus::Ok
    }
}
