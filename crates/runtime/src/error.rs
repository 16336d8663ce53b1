use crate::model::ModelError;
use crate::tools::ToolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Mcp(#[from] mcp::Error),

    /// The caller abandoned the turn.
    #[error("chat turn cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
