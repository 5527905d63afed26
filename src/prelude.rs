//! Convenience re-exports for common use.

pub use crate::aggregate::{AggregatedResponse, OverallStatus};
pub use crate::catalog::{SearchQuery, ToolSchema};
pub use crate::config::{HostConfig, ServerEntry};
pub use crate::connection::{ConnectionState, ServerStatus};
pub use crate::dispatch::{InvocationOutcome, InvocationRequest, OutcomeStatus, TargetSelection};
pub use crate::error::{Result, ToolHostError};
pub use crate::facade::{ToolDefinition, ToolHost};
pub use crate::transport::{ToolTransport, TransportFactory, TransportRegistry};
