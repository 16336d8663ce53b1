//! Core model types (provider-agnostic).
//!
//! These types represent the concepts shared across LLM providers.
//! Provider-specific wire formats belong in adapter modules.

use super::errors::ModelError;
use crate::tools::ToolError;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;

/// Role of a message participant.
///
/// The system instruction travels separately in [`ModelRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlates the call with its result.
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// The result the runtime returned for a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    Success {
        tool_call_id: String,
        output: String,
    },
    Failure {
        tool_call_id: String,
        error: ToolError,
    },
}

impl ToolResult {
    pub fn success(tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Success {
            tool_call_id: tool_call_id.into(),
            output: output.into(),
        }
    }

    pub fn failure(tool_call_id: impl Into<String>, error: ToolError) -> Self {
        Self::Failure {
            tool_call_id: tool_call_id.into(),
            error,
        }
    }

    pub fn tool_call_id(&self) -> &str {
        match self {
            Self::Success { tool_call_id, .. } | Self::Failure { tool_call_id, .. } => tool_call_id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    /// Text handed back to the model: the output, or `Error: <message>`.
    pub fn content(&self) -> String {
        match self {
            Self::Success { output, .. } => output.clone(),
            Self::Failure { error, .. } => format!("Error: {}", error.message()),
        }
    }
}

/// A part of a message, which can be text or a tool interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Part {
    Text(String),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

/// A message, consisting of a role and one or more parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// A user turn carrying tool results, in the given order.
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            role: Role::User,
            parts: results.into_iter().map(Part::ToolResult).collect(),
        }
    }

    /// The text parts, in order.
    pub fn text_segments(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Get combined text content from all text parts.
    pub fn text(&self) -> String {
        self.text_segments().concat()
    }

    /// Extract all tool calls from this message, in emission order.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::ToolCall(call) => Some(call.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_result_parts(&self) -> Vec<&ToolResult> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::ToolResult(result) => Some(result),
                _ => None,
            })
            .collect()
    }
}

/// A tool definition exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

impl From<mcp::Tool> for ToolSpec {
    fn from(tool: mcp::Tool) -> Self {
        Self {
            name: tool.name,
            description: tool.description,
            schema: tool.input_schema,
        }
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Natural end of the turn; the reply is final.
    EndTurn,
    /// The model wants tools executed.
    ToolUse,
    /// Hit the token budget.
    MaxTokens,
    /// Anything else (stop sequences, refusals, future values).
    Other(String),
}

impl From<&str> for StopReason {
    fn from(value: &str) -> Self {
        match value {
            "end_turn" => Self::EndTurn,
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Everything needed for a model request.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub system: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolSpec],
}

/// The response from a model.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub message: Message,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

/// Lazy, finite, non-restartable sequence of text increments.
pub type TextStream = BoxStream<'static, Result<String, ModelError>>;

/// Trait for LLM provider backends.
pub trait Backend: Send + Sync {
    /// Run one completion and wait for the whole reply.
    fn call(
        &self,
        request: ModelRequest<'_>,
    ) -> impl Future<Output = Result<ModelResponse, ModelError>> + Send;

    /// Run one completion, yielding text as it is produced.
    fn stream(
        &self,
        request: ModelRequest<'_>,
    ) -> impl Future<Output = Result<TextStream, ModelError>> + Send;
}
