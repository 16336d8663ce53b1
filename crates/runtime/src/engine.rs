//! Model/tool orchestration loop.
//!
//! One chat turn runs a small state machine:
//!
//! ```text
//! Calling ──tool_use──▶ ExecutingTools ──▶ Calling
//!    │
//!    └──end_turn / other──▶ Done
//! ```
//!
//! The `Calling` state is entered at most `max_tool_iterations` times per
//! turn. Tool calls run one at a time in the order the model emitted them.

use futures::{StreamExt, TryStreamExt};
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::{Backend, Message, ModelRequest, StopReason, ToolCall, ToolResult, ToolSpec};
use crate::tools::ToolHost;
use crate::{Error, Result};

pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 5;

/// Returned when the model's final reply has no text.
pub const NO_RESPONSE: &str = "No response generated.";

/// Returned when the iteration budget runs out before a final answer.
pub const ITERATION_LIMIT_RESPONSE: &str =
    "I apologize, but I couldn't complete the request within the allowed tool execution limit.";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant with access to external \
tools. Use the appropriate tools to fetch the information the user asks about, and be helpful, \
concise, and accurate in your responses.";

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub system_prompt: String,
    pub max_tool_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
        }
    }
}

enum TurnState {
    Calling,
    ExecutingTools(Message),
    Done(String),
}

/// Drives a model backend and a tool host through chat turns.
///
/// The engine holds no conversation state between turns: history is passed
/// in by the caller and the working transcript is dropped when a turn ends.
pub struct Engine<B, H> {
    backend: B,
    tools: H,
    config: EngineConfig,
}

impl<B: Backend, H: ToolHost> Engine<B, H> {
    pub fn new(backend: B, tools: H) -> Self {
        Self::with_config(backend, tools, EngineConfig::default())
    }

    pub fn with_config(backend: B, tools: H, config: EngineConfig) -> Self {
        Self {
            backend,
            tools,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn tools(&self) -> &H {
        &self.tools
    }

    /// Run one turn to a final answer.
    ///
    /// Tool failures are reported to the model, not to the caller. Running
    /// out of iterations yields [`ITERATION_LIMIT_RESPONSE`].
    pub async fn chat(&self, history: &[Message], user_input: &str) -> Result<String> {
        let specs = self.tools.specs().await?;
        let mut messages = conversation(history, user_input);
        let mut model_calls = 0;
        let mut state = TurnState::Calling;

        loop {
            state = match state {
                TurnState::Calling => {
                    if model_calls == self.config.max_tool_iterations {
                        warn!(
                            limit = self.config.max_tool_iterations,
                            "tool iteration budget exhausted"
                        );
                        return Ok(ITERATION_LIMIT_RESPONSE.to_string());
                    }
                    model_calls += 1;

                    let response = self.backend.call(self.request(&messages, &specs)).await?;
                    debug!(
                        iteration = model_calls,
                        stop_reason = ?response.stop_reason,
                        input_tokens = response.usage.input_tokens,
                        output_tokens = response.usage.output_tokens,
                        "model replied"
                    );

                    match response.stop_reason {
                        StopReason::ToolUse if !response.message.tool_calls().is_empty() => {
                            TurnState::ExecutingTools(response.message)
                        }
                        _ => TurnState::Done(final_text(&response.message)),
                    }
                }
                TurnState::ExecutingTools(reply) => {
                    let calls = reply.tool_calls();
                    messages.push(reply);

                    let mut results = Vec::with_capacity(calls.len());
                    for call in &calls {
                        results.push(self.execute(call).await?);
                    }
                    messages.push(Message::tool_results(results));
                    TurnState::Calling
                }
                TurnState::Done(text) => {
                    info!(model_calls, "chat turn complete");
                    return Ok(text);
                }
            };
        }
    }

    /// Like [`Engine::chat`], but gives up with [`Error::Cancelled`] once
    /// `cancel` fires.
    ///
    /// An in-flight tool request is still read to completion by the session,
    /// so later turns stay aligned with the tool server.
    pub async fn chat_until_cancelled(
        &self,
        history: &[Message],
        user_input: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("chat turn cancelled");
                Err(Error::Cancelled)
            }
            result = self.chat(history, user_input) => result,
        }
    }

    /// Stream the text of a single model round trip.
    ///
    /// Same system prompt, messages and tool catalog as [`Engine::chat`], but
    /// tool calls requested by the model are not executed.
    pub async fn chat_stream(
        &self,
        history: &[Message],
        user_input: &str,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let specs = self.tools.specs().await?;
        let messages = conversation(history, user_input);
        let text = self.backend.stream(self.request(&messages, &specs)).await?;
        Ok(text.map_err(Error::from).boxed())
    }

    fn request<'a>(&'a self, messages: &'a [Message], tools: &'a [ToolSpec]) -> ModelRequest<'a> {
        ModelRequest {
            system: &self.config.system_prompt,
            messages,
            tools,
        }
    }

    /// Run one tool call, folding recoverable failures into the result.
    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        info!(tool = %call.name, id = %call.id, input = %call.input, "executing tool");
        match self.tools.execute(call).await {
            Ok(output) => Ok(ToolResult::success(&call.id, output)),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!(tool = %call.name, id = %call.id, "tool call failed: {e}");
                Ok(ToolResult::failure(&call.id, e))
            }
        }
    }
}

fn conversation(history: &[Message], user_input: &str) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.extend_from_slice(history);
    messages.push(Message::user(user_input));
    messages
}

/// Text segments joined by newlines, or [`NO_RESPONSE`] when there are none.
fn final_text(message: &Message) -> String {
    let text = message.text_segments().join("\n");
    if text.is_empty() {
        NO_RESPONSE.to_string()
    } else {
        text
    }
}
