//! Tool host trait.

use crate::model::{ToolCall, ToolSpec};
use crate::tools::ToolError;
use std::future::Future;

/// Trait for tool execution hosts.
///
/// Implementations provide tool specifications and execute tool calls.
/// This is the boundary between the model loop and side effects: a call
/// either yields the tool's text output or an error the loop can fold back
/// into the conversation.
pub trait ToolHost: Send + Sync {
    /// Get available tool specifications.
    fn specs(&self) -> impl Future<Output = Result<Vec<ToolSpec>, ToolError>> + Send;

    /// Execute a tool call.
    fn execute(&self, call: &ToolCall) -> impl Future<Output = Result<String, ToolError>> + Send;
}
