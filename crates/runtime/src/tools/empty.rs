//! Empty tool host implementation.

use crate::model::{ToolCall, ToolSpec};
use crate::tools::{ToolError, ToolHost};

/// A no-op tool host with no tools.
///
/// Useful for testing or when no tool server is configured.
#[derive(Debug, Default)]
pub struct EmptyToolHost;

impl ToolHost for EmptyToolHost {
    async fn specs(&self) -> Result<Vec<ToolSpec>, ToolError> {
        Ok(Vec::new())
    }

    async fn execute(&self, call: &ToolCall) -> Result<String, ToolError> {
        Err(ToolError::NotFound(call.name.clone()))
    }
}
