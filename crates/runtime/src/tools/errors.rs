use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during tool discovery or execution.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("tool catalog unavailable: {0}")]
    Catalog(String),
    /// The tool server is gone; no further calls can succeed.
    #[error("tool server disconnected: {0}")]
    Disconnected(String),
}

impl ToolError {
    /// Whether this error ends the orchestration run instead of being
    /// reported back to the model.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Catalog(_) | Self::Disconnected(_))
    }

    /// The detail without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(m)
            | Self::InvalidInput(m)
            | Self::Execution(m)
            | Self::Catalog(m)
            | Self::Disconnected(m) => m,
        }
    }
}
