//! Anthropic Messages API backend.

use crate::model::{
    Backend, Message, ModelError, ModelRequest, ModelResponse, Part, Role, StopReason, TextStream,
    ToolCall, ToolResult, ToolSpec, Usage,
};
use futures::{StreamExt, TryStreamExt, future};
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::sse;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Authentication mode for the Anthropic API.
#[derive(Debug, Clone)]
pub enum AnthropicAuth {
    /// Standard API key (`x-api-key`).
    ApiKey(String),
    /// OAuth access token (`Authorization: Bearer`).
    OauthToken(String),
}

impl std::fmt::Display for AnthropicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => write!(f, "api_key"),
            Self::OauthToken(_) => write!(f, "oauth_token"),
        }
    }
}

impl AnthropicAuth {
    fn apply_headers(&self, req: RequestBuilder) -> RequestBuilder {
        match self {
            Self::ApiKey(key) => req.header("x-api-key", key),
            Self::OauthToken(token) => req.header("Authorization", format!("Bearer {token}")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: ApiContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Blocks(Vec<ApiContentBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiStreamEvent {
    ContentBlockDelta { delta: ApiDelta },
    Error { error: ApiErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default, rename = "type")]
    kind: String,
    message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for creating an Anthropic backend.
#[derive(Debug, Clone)]
pub struct AnthropicBackendBuilder {
    auth: AnthropicAuth,
    model: String,
    max_tokens: u32,
    base_url: String,
}

impl AnthropicBackendBuilder {
    pub fn new(auth: AnthropicAuth, model: impl Into<String>) -> Self {
        Self {
            auth,
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Override the endpoint (proxies, gateways).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn build(self) -> AnthropicBackend {
        AnthropicBackend {
            client: reqwest::Client::new(),
            auth: self.auth,
            model: self.model,
            max_tokens: self.max_tokens,
            url: self.base_url,
        }
    }
}

/// Anthropic API backend.
pub struct AnthropicBackend {
    client: reqwest::Client,
    auth: AnthropicAuth,
    model: String,
    max_tokens: u32,
    url: String,
}

impl AnthropicBackend {
    pub fn builder(auth: AnthropicAuth, model: impl Into<String>) -> AnthropicBackendBuilder {
        AnthropicBackendBuilder::new(auth, model)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn role_to_api(role: Role) -> &'static str {
        match role {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn message_to_api(msg: &Message) -> ApiMessage {
        let role = Self::role_to_api(msg.role);

        // Simple case: single text part
        if let [Part::Text(text)] = msg.parts.as_slice() {
            return ApiMessage {
                role,
                content: ApiContent::Text(text.clone()),
            };
        }

        let blocks = msg
            .parts
            .iter()
            .map(|part| match part {
                Part::Text(text) => ApiContentBlock::Text { text: text.clone() },
                Part::ToolCall(call) => ApiContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                },
                Part::ToolResult(result) => ApiContentBlock::ToolResult {
                    tool_use_id: result.tool_call_id().to_string(),
                    content: result.content(),
                    is_error: matches!(result, ToolResult::Failure { .. }),
                },
            })
            .collect();

        ApiMessage {
            role,
            content: ApiContent::Blocks(blocks),
        }
    }

    fn tool_to_api(spec: &ToolSpec) -> ApiTool {
        ApiTool {
            name: spec.name.clone(),
            description: spec.description.clone(),
            input_schema: spec.schema.clone(),
        }
    }

    fn response_to_message(blocks: Vec<ApiResponseBlock>) -> Message {
        let parts = blocks
            .into_iter()
            .filter_map(|block| match block {
                ApiResponseBlock::Text { text } => Some(Part::Text(text)),
                ApiResponseBlock::ToolUse { id, name, input } => {
                    Some(Part::ToolCall(ToolCall { id, name, input }))
                }
                ApiResponseBlock::Unknown => None,
            })
            .collect();

        Message {
            role: Role::Assistant,
            parts,
        }
    }

    fn build_request(&self, request: ModelRequest<'_>, stream: bool) -> ApiRequest {
        ApiRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: request.messages.iter().map(Self::message_to_api).collect(),
            system: request.system.to_string(),
            tools: request.tools.iter().map(Self::tool_to_api).collect(),
            stream,
        }
    }

    async fn send(&self, body: &ApiRequest) -> Result<reqwest::Response, ModelError> {
        let req = self
            .client
            .post(&self.url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json");
        let req = self.auth.apply_headers(req);

        let response = req
            .json(body)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api(format!("{status}: {body}")));
        }
        Ok(response)
    }
}

impl std::fmt::Display for AnthropicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "anthropic({}, auth={})", self.model, self.auth)
    }
}

impl Backend for AnthropicBackend {
    async fn call(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
        let body = self.build_request(request, false);
        debug!(
            model = %self.model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            "calling model"
        );

        let api_response: ApiResponse = self
            .send(&body)
            .await?
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        let stop_reason = api_response
            .stop_reason
            .as_deref()
            .map(StopReason::from)
            .unwrap_or(StopReason::EndTurn);
        let message = Self::response_to_message(api_response.content);
        let usage = Usage {
            input_tokens: api_response.usage.input_tokens,
            output_tokens: api_response.usage.output_tokens,
        };

        Ok(ModelResponse {
            message,
            stop_reason,
            usage,
        })
    }

    async fn stream(&self, request: ModelRequest<'_>) -> Result<TextStream, ModelError> {
        let body = self.build_request(request, true);
        debug!(model = %self.model, messages = body.messages.len(), "streaming model");

        let response = self.send(&body).await?;
        let text = sse::data_events(response.bytes_stream())
            .try_filter_map(|data| future::ready(text_delta(&data)));
        Ok(text.boxed())
    }
}

/// Text carried by one streamed event, if any.
fn text_delta(data: &str) -> Result<Option<String>, ModelError> {
    let event: ApiStreamEvent = serde_json::from_str(data)
        .map_err(|e| ModelError::InvalidResponse(format!("stream event: {e}")))?;
    match event {
        ApiStreamEvent::ContentBlockDelta {
            delta: ApiDelta::TextDelta { text },
        } => Ok(Some(text)),
        ApiStreamEvent::Error { error } => {
            Err(ModelError::Api(format!("{}: {}", error.kind, error.message)))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolError;
    use serde_json::json;

    #[test]
    fn auth_display() {
        let api = AnthropicAuth::ApiKey("test".into());
        let oauth = AnthropicAuth::OauthToken("test".into());
        assert_eq!(api.to_string(), "api_key");
        assert_eq!(oauth.to_string(), "oauth_token");
    }

    #[test]
    fn request_includes_system_tools_and_blocks() {
        let backend = AnthropicBackend::builder(AnthropicAuth::ApiKey("k".into()), "m").build();
        let messages = vec![
            Message::user("find Alice"),
            Message {
                role: Role::Assistant,
                parts: vec![
                    Part::Text("Looking".into()),
                    Part::ToolCall(ToolCall {
                        id: "tu_1".into(),
                        name: "search_contacts".into(),
                        input: json!({"name": "Alice"}),
                    }),
                ],
            },
            Message::tool_results(vec![ToolResult::failure(
                "tu_1",
                ToolError::Execution("offline".into()),
            )]),
        ];
        let tools = vec![ToolSpec {
            name: "search_contacts".into(),
            description: "Search".into(),
            schema: json!({"type": "object"}),
        }];
        let request = ModelRequest {
            system: "be brief",
            messages: &messages,
            tools: &tools,
        };

        let body = serde_json::to_value(backend.build_request(request, false)).unwrap();
        assert_eq!(body["system"], "be brief");
        assert!(body.get("stream").is_none());
        assert_eq!(body["tools"][0]["input_schema"], json!({"type": "object"}));
        assert_eq!(body["messages"][0]["content"], "find Alice");
        assert_eq!(body["messages"][1]["content"][1]["type"], "tool_use");
        assert_eq!(body["messages"][1]["content"][1]["id"], "tu_1");
        let result = &body["messages"][2]["content"][0];
        assert_eq!(result["type"], "tool_result");
        assert_eq!(result["tool_use_id"], "tu_1");
        assert_eq!(result["is_error"], true);
        assert_eq!(result["content"], "Error: offline");
    }

    #[test]
    fn request_without_tools_omits_them() {
        let backend = AnthropicBackend::builder(AnthropicAuth::ApiKey("k".into()), "m").build();
        let messages = vec![Message::user("hi")];
        let request = ModelRequest {
            system: "",
            messages: &messages,
            tools: &[],
        };
        let body = serde_json::to_value(backend.build_request(request, true)).unwrap();
        assert!(body.get("tools").is_none());
        assert!(body.get("system").is_none());
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn response_blocks_map_to_parts() {
        let api: ApiResponse = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "thinking", "thinking": "..."},
                {"type": "tool_use", "id": "tu_1", "name": "list_chats", "input": {}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }))
        .unwrap();
        assert_eq!(api.stop_reason.as_deref(), Some("tool_use"));

        let message = AnthropicBackend::response_to_message(api.content);
        assert_eq!(message.parts.len(), 2);
        assert_eq!(message.text(), "Let me check.");
        assert_eq!(message.tool_calls()[0].name, "list_chats");
    }

    #[test]
    fn stream_events_yield_text_deltas() {
        let delta = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        assert_eq!(text_delta(delta).unwrap().as_deref(), Some("Hi"));

        let json_delta = r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{"}}"#;
        assert_eq!(text_delta(json_delta).unwrap(), None);

        assert_eq!(text_delta(r#"{"type":"message_stop"}"#).unwrap(), None);

        let error = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert!(matches!(text_delta(error), Err(ModelError::Api(ref m)) if m.contains("Overloaded")));
    }
}
