//! Roci Tool Host: one tool in front of many MCP capability servers.
//!
//! The host loads server descriptors, keeps one connection per server,
//! caches each server's tool schemas, validates arguments, fans calls out
//! concurrently under a global ceiling and merges the per-server outcomes
//! into a single response with provenance.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use roci_toolhost::prelude::*;
//!
//! # async fn example() -> roci_toolhost::error::Result<()> {
//! let Some(config) = HostConfig::load_default()? else {
//!     return Ok(());
//! };
//! let registry = Arc::new(TransportRegistry::default());
//! let Some(host) = ToolHost::from_config(config, registry)? else {
//!     return Ok(());
//! };
//! host.start().await;
//!
//! let tools = host.discover(&SearchQuery::text("search")).await;
//! println!("{} tools", tools.len());
//!
//! let request = InvocationRequest::new("search", serde_json::json!({ "query": "rust" }));
//! let response = host.invoke(request).await?;
//! println!("{}", response.to_agent_value());
//! host.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod facade;
pub mod instructions;
pub mod prelude;
pub mod transport;
pub mod validation;

pub use aggregate::{AggregatedResponse, OverallStatus};
pub use error::{Result, ToolHostError};
pub use facade::{HostContext, ToolDefinition, ToolHost, TOOL_NAME};
