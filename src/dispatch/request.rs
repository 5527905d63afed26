//! Invocation requests.

use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::error::{Result, ToolHostError};

/// How many providers a request goes to.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TargetSelection {
    /// Every valid provider.
    #[default]
    FanOut,
    /// Only the first valid provider by server name.
    FirstAvailable,
}

/// One call of one tool, possibly against several servers.
#[derive(Debug, Clone, Builder)]
pub struct InvocationRequest {
    #[builder(into)]
    pub tool_name: String,
    /// `null` means no arguments.
    #[builder(default)]
    pub arguments: Value,
    /// Empty means every server advertising `tool_name`.
    #[builder(default)]
    pub target_servers: Vec<String>,
    #[builder(default = Uuid::new_v4())]
    pub request_id: Uuid,
    /// Caller deadline for the whole request.
    pub timeout: Option<Duration>,
    #[builder(default)]
    pub selection: TargetSelection,
}

impl InvocationRequest {
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self::builder().tool_name(tool_name).arguments(arguments).build()
    }

    /// Reject requests that cannot be routed at all.
    pub fn check(&self) -> Result<()> {
        if self.tool_name.trim().is_empty() {
            return Err(ToolHostError::InvalidRequest(
                "tool_name must not be empty".into(),
            ));
        }
        if !(self.arguments.is_null() || self.arguments.is_object()) {
            return Err(ToolHostError::InvalidRequest(
                "arguments must be a JSON object or null".into(),
            ));
        }
        if let Some(target) = self.target_servers.iter().find(|t| t.trim().is_empty()) {
            return Err(ToolHostError::InvalidRequest(format!(
                "target server name '{target}' is empty"
            )));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ToolHostError::InvalidRequest(
                "timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
