//! CLI error types.

use thiserror::Error;

use crate::config::ConfigError;

/// CLI errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration is invalid or missing required fields.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An error occurred in the runtime layer.
    #[error(transparent)]
    Runtime(#[from] runtime::Error),

    /// The tool server failed outside of a chat turn.
    #[error(transparent)]
    Mcp(#[from] mcp::Error),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the REPL can keep going after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Runtime(runtime::Error::Tool(e)) => !e.is_fatal(),
            Self::Runtime(runtime::Error::Mcp(e)) | Self::Mcp(e) => !e.is_fatal(),
            Self::Runtime(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
