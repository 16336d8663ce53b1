//! Inbound chat API.
//!
//! Request and reply shapes for a front end talking to the engine, plus
//! the handlers that turn engine results into them.

use futures::stream::{self, BoxStream};
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tracing::warn;

use crate::Engine;
use crate::model::{Backend, Message, Role};
use crate::tools::ToolHost;

/// One user message plus optional prior turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryEntry>>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            history: None,
        }
    }

    pub fn with_history(mut self, history: Vec<HistoryEntry>) -> Self {
        self.history = Some(history);
        self
    }

    /// Prior turns as engine messages.
    pub fn history_messages(&self) -> Vec<Message> {
        self.history
            .iter()
            .flatten()
            .map(Message::from)
            .collect()
    }
}

/// A prior turn of plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

impl From<&HistoryEntry> for Message {
    fn from(entry: &HistoryEntry) -> Self {
        Message::new(entry.role, entry.content.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    pub success: bool,
}

/// One frame of a streamed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Chunk { content: String },
    End,
    Error { message: String },
}

impl StreamEvent {
    fn error(message: impl Display) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }
}

const EMPTY_MESSAGE: &str = "Empty message";

/// Run one full chat turn. Never fails: errors come back with
/// `success: false`.
pub async fn handle_chat<B: Backend, H: ToolHost>(
    engine: &Engine<B, H>,
    request: &ChatRequest,
) -> ChatResponse {
    if request.message.is_empty() {
        return ChatResponse {
            response: format!("Chat error: {EMPTY_MESSAGE}"),
            success: false,
        };
    }

    match engine
        .chat(&request.history_messages(), &request.message)
        .await
    {
        Ok(response) => ChatResponse {
            response,
            success: true,
        },
        Err(e) => {
            warn!("chat failed: {e}");
            ChatResponse {
                response: format!("Chat error: {e}"),
                success: false,
            }
        }
    }
}

/// Stream one reply as events: chunks then `end`, or a single trailing
/// `error`.
pub async fn chat_events<B: Backend, H: ToolHost>(
    engine: &Engine<B, H>,
    request: &ChatRequest,
) -> BoxStream<'static, StreamEvent> {
    if request.message.is_empty() {
        return stream::iter([StreamEvent::error(EMPTY_MESSAGE)]).boxed();
    }

    let text = match engine
        .chat_stream(&request.history_messages(), &request.message)
        .await
    {
        Ok(text) => text,
        Err(e) => {
            warn!("chat stream failed to start: {e}");
            return stream::iter([StreamEvent::error(e)]).boxed();
        }
    };

    text.map(|chunk| match chunk {
        Ok(content) => StreamEvent::Chunk { content },
        Err(e) => StreamEvent::error(e),
    })
    .chain(stream::once(async { StreamEvent::End }))
    .scan(false, |failed, event| {
        let next = (!*failed).then(|| {
            *failed = matches!(event, StreamEvent::Error { .. });
            event
        });
        async move { next }
    })
    .boxed()
}

/// Forward [`chat_events`] into `sink`.
pub async fn handle_chat_stream<B, H, S>(
    engine: &Engine<B, H>,
    request: &ChatRequest,
    sink: &mut S,
) -> Result<(), S::Error>
where
    B: Backend,
    H: ToolHost,
    S: Sink<StreamEvent> + Unpin,
{
    let mut events = chat_events(engine, request).await.map(Ok::<_, S::Error>);
    sink.send_all(&mut events).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ModelError, ModelRequest, ModelResponse, Part, StopReason, TextStream, Usage,
    };
    use crate::tools::EmptyToolHost;
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers with a fixed outcome and records the messages it saw.
    struct FixedBackend {
        outcome: Result<Vec<&'static str>, &'static str>,
        fail_mid_stream: bool,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl FixedBackend {
        fn ok(chunks: Vec<&'static str>) -> Self {
            Self {
                outcome: Ok(chunks),
                fail_mid_stream: false,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing(message: &'static str) -> Self {
            Self {
                outcome: Err(message),
                ..Self::ok(vec![])
            }
        }
    }

    impl Backend for FixedBackend {
        async fn call(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
            self.seen.lock().unwrap().push(request.messages.to_vec());
            let chunks = self.outcome.clone().map_err(|m| ModelError::Api(m.into()))?;
            Ok(ModelResponse {
                message: Message {
                    role: Role::Assistant,
                    parts: vec![Part::Text(chunks.concat())],
                },
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
            })
        }

        async fn stream(&self, request: ModelRequest<'_>) -> Result<TextStream, ModelError> {
            self.seen.lock().unwrap().push(request.messages.to_vec());
            let chunks = self.outcome.clone().map_err(|m| ModelError::Api(m.into()))?;
            let mut items: Vec<Result<String, ModelError>> =
                chunks.into_iter().map(|c| Ok(c.to_string())).collect();
            if self.fail_mid_stream {
                items.push(Err(ModelError::Network("connection reset".into())));
                items.push(Ok("never sent".into()));
            }
            Ok(stream::iter(items).boxed())
        }
    }

    #[test]
    fn request_wire_format() {
        let request: ChatRequest = serde_json::from_value(json!({
            "message": "Any news?",
            "history": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"}
            ]
        }))
        .unwrap();
        assert_eq!(
            request,
            ChatRequest::new("Any news?").with_history(vec![
                HistoryEntry::user("hi"),
                HistoryEntry::assistant("hello"),
            ])
        );

        let bare: ChatRequest = serde_json::from_str(r#"{"message": "x"}"#).unwrap();
        assert!(bare.history.is_none());
        assert!(bare.history_messages().is_empty());
    }

    #[test]
    fn stream_event_wire_format() {
        let chunk = StreamEvent::Chunk {
            content: "Hi".into(),
        };
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({"type": "chunk", "content": "Hi"})
        );
        assert_eq!(
            serde_json::to_value(StreamEvent::End).unwrap(),
            json!({"type": "end"})
        );
        assert_eq!(
            serde_json::to_value(StreamEvent::error("boom")).unwrap(),
            json!({"type": "error", "message": "boom"})
        );
    }

    #[tokio::test]
    async fn chat_success_uses_history() {
        let engine = Engine::new(FixedBackend::ok(vec!["All ", "quiet."]), EmptyToolHost);
        let request =
            ChatRequest::new("Any news?").with_history(vec![HistoryEntry::user("hi")]);

        let response = handle_chat(&engine, &request).await;

        assert_eq!(
            response,
            ChatResponse {
                response: "All quiet.".into(),
                success: true,
            }
        );
        let seen = engine.backend().seen.lock().unwrap().clone();
        assert_eq!(seen[0].len(), 2);
        assert_eq!(seen[0][0].text(), "hi");
    }

    #[tokio::test]
    async fn chat_failure_is_reported_not_raised() {
        let engine = Engine::new(FixedBackend::failing("overloaded"), EmptyToolHost);
        let response = handle_chat(&engine, &ChatRequest::new("hi")).await;
        assert!(!response.success);
        assert!(response.response.starts_with("Chat error: "));
        assert!(response.response.contains("overloaded"));
    }

    #[tokio::test]
    async fn stream_chunks_then_end() {
        let engine = Engine::new(FixedBackend::ok(vec!["Hel", "lo"]), EmptyToolHost);
        let mut sink = Vec::new();

        handle_chat_stream(&engine, &ChatRequest::new("hi"), &mut sink)
            .await
            .unwrap();

        assert_eq!(
            sink,
            vec![
                StreamEvent::Chunk {
                    content: "Hel".into()
                },
                StreamEvent::Chunk {
                    content: "lo".into()
                },
                StreamEvent::End,
            ]
        );
    }

    #[tokio::test]
    async fn stream_empty_message() {
        let engine = Engine::new(FixedBackend::ok(vec!["unused"]), EmptyToolHost);
        let events: Vec<_> = chat_events(&engine, &ChatRequest::new("")).await.collect().await;
        assert_eq!(events, vec![StreamEvent::error("Empty message")]);
        assert!(engine.backend().seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stream_start_failure_is_single_error() {
        let engine = Engine::new(FixedBackend::failing("bad key"), EmptyToolHost);
        let events: Vec<_> = chat_events(&engine, &ChatRequest::new("hi")).await.collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error { message } if message.contains("bad key")));
    }

    #[tokio::test]
    async fn stream_stops_after_mid_stream_error() {
        let backend = FixedBackend {
            fail_mid_stream: true,
            ..FixedBackend::ok(vec!["partial"])
        };
        let engine = Engine::new(backend, EmptyToolHost);
        let events: Vec<_> = chat_events(&engine, &ChatRequest::new("hi")).await.collect().await;

        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            StreamEvent::Chunk {
                content: "partial".into()
            }
        );
        assert!(matches!(&events[1], StreamEvent::Error { message } if message.contains("connection reset")));
    }
}
