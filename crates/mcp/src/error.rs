//! Tool-protocol error types.

use crate::protocol::JsonRpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn tool server: {0}")]
    Spawn(#[source] std::io::Error),

    /// The handshake did not complete. Fatal for startup.
    #[error("protocol initialization failed: {reason}")]
    ProtocolInit { reason: String },

    /// The server closed its output while a response was pending. Fatal for
    /// the session: message alignment cannot be recovered.
    #[error("tool server closed the connection")]
    ConnectionClosed,

    #[error("session stopped")]
    Stopped,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("failed to list tools: {0}")]
    ToolList(String),

    #[error("tool call failed: {0}")]
    ToolCall(String),

    #[error("output too large: {size} bytes (max {max})")]
    OutputTooLarge { size: usize, max: usize },
}

impl Error {
    pub(crate) fn init(reason: impl std::fmt::Display) -> Self {
        Self::ProtocolInit {
            reason: reason.to_string(),
        }
    }

    /// Whether the session can no longer be used after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolInit { .. } | Self::ConnectionClosed | Self::Stopped | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
