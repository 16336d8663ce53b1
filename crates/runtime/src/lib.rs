//! Chat runtime: model backends, tool hosts and the orchestration engine.
//!
//! # Overview
//!
//! - **Backend**: a trait abstracting model providers (Anthropic, etc.).
//! - **ToolHost**: a trait abstracting where tools come from. [`McpToolHost`]
//!   serves them from a tool server session.
//! - **Engine**: runs a chat turn, looping between the model and the tools
//!   until the model gives a final answer.
//! - **api**: request and reply shapes for front ends.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use runtime::{AnthropicAuth, AnthropicBackend, Engine, McpToolHost};
//!
//! # async fn example() -> runtime::Result<()> {
//! let config = mcp::ServerConfig::new("whatsapp", "uv").args(["run", "main.py"]);
//! let session = Arc::new(mcp::Session::start(config).await?);
//!
//! let auth = AnthropicAuth::ApiKey("sk-ant-api01-...".into());
//! let backend = AnthropicBackend::builder(auth, "claude-sonnet-4-20250514").build();
//! let engine = Engine::new(backend, McpToolHost::new(session.clone()));
//!
//! let answer = engine.chat(&[], "Who messaged me today?").await?;
//! println!("{answer}");
//!
//! session.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
mod engine;
mod error;
pub mod model;
mod providers;
pub mod tools;

pub use engine::{
    DEFAULT_MAX_TOOL_ITERATIONS, DEFAULT_SYSTEM_PROMPT, Engine, EngineConfig,
    ITERATION_LIMIT_RESPONSE, NO_RESPONSE,
};
pub use error::{Error, Result};

pub use model::{Backend, Message, ModelError, Role, ToolCall, ToolResult, ToolSpec};
pub use providers::{AnthropicAuth, AnthropicBackend, AnthropicBackendBuilder};
pub use tools::{EmptyToolHost, McpToolHost, ToolError, ToolHost};
