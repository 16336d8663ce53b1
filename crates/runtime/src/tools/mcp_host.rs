//! MCP-backed tool host.

use std::sync::Arc;

use mcp::Session;
use serde_json::{Map, Value};
use tracing::debug;

use super::{ToolError, ToolHost};
use crate::model::{ToolCall, ToolSpec};

/// Tool host backed by a shared tool server session.
///
/// The catalog is cached by the session itself, so `specs` only reaches the
/// server once.
#[derive(Clone)]
pub struct McpToolHost {
    session: Arc<Session>,
}

impl McpToolHost {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl ToolHost for McpToolHost {
    async fn specs(&self) -> Result<Vec<ToolSpec>, ToolError> {
        let tools = self.session.list_tools().await.map_err(|e| {
            if e.is_fatal() {
                ToolError::Disconnected(e.to_string())
            } else {
                ToolError::Catalog(e.to_string())
            }
        })?;
        Ok(tools.into_iter().map(ToolSpec::from).collect())
    }

    async fn execute(&self, call: &ToolCall) -> Result<String, ToolError> {
        let arguments = tool_arguments(&call.input)?;
        debug!(tool = %call.name, id = %call.id, "executing tool");
        self.session
            .call_tool(&call.name, arguments)
            .await
            .map_err(|e| match e {
                mcp::Error::ToolCall(message) => ToolError::Execution(message),
                e if e.is_fatal() => ToolError::Disconnected(e.to_string()),
                e => ToolError::Execution(e.to_string()),
            })
    }
}

/// Tool arguments must be a JSON object; `null` means no arguments.
fn tool_arguments(input: &Value) -> Result<Map<String, Value>, ToolError> {
    match input {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        other => Err(ToolError::InvalidInput(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}
