//! Error types for the tool host.

use strum::Display;
use thiserror::Error;

/// Coarse classification used for retry and degradation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Connection,
    Validation,
    Timeout,
    Routing,
    Server,
    Request,
    Cancelled,
    Internal,
}

/// Primary error type for all tool host operations.
#[derive(Error, Debug)]
pub enum ToolHostError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error ({server}): {message}")]
    Connection { server: String, message: String },

    #[error("Validation error at {path}: {reason}")]
    Validation { path: String, reason: String },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("No server advertises tool '{tool_name}'")]
    NoMatchingServer { tool_name: String },

    #[error("Server error ({server}): {message}")]
    Server {
        server: String,
        code: Option<i64>,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Tool host is disabled")]
    Disabled,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl ToolHostError {
    /// Create a connection error for a server.
    pub fn connection(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Create a server-reported error without a JSON-RPC code.
    pub fn server(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Server {
            server: server.into(),
            code: None,
            message: message.into(),
            data: None,
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::ConfigParse(_) => ErrorCategory::Configuration,
            Self::Connection { .. } | Self::Network(_) | Self::Io(_) => ErrorCategory::Connection,
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::NoMatchingServer { .. } | Self::UnknownServer(_) => ErrorCategory::Routing,
            Self::Server { .. } => ErrorCategory::Server,
            Self::InvalidRequest(_) | Self::Disabled => ErrorCategory::Request,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Serialization(_) | Self::InvalidState(_) => ErrorCategory::Internal,
        }
    }

    /// Whether this error means the transport itself is unhealthy.
    ///
    /// Retryable errors degrade the owning connection; everything else is
    /// reported against the single call that produced it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Connection | ErrorCategory::Timeout
        )
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ToolHostError>;
