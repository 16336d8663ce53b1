//! Scripted in-process tool server for tests.
//!
//! [`FakeServer`] speaks the tool protocol over a `tokio::io::duplex` pipe
//! and records every message it receives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::BufReader;

use crate::error::Result;
use crate::session::Session;
use crate::transport::{read_frame, write_frame};

/// How the fake server answers a `tools/call`.
#[derive(Debug, Clone)]
pub enum CallReply {
    /// `result` payload sent verbatim.
    Result(Value),
    /// JSON-RPC error with this message.
    Error(String),
    /// Reply after a delay.
    Delayed(Duration, Box<CallReply>),
    /// Answer with an id the client never sent.
    WrongId,
    /// Close the connection instead of answering.
    Hangup,
}

impl CallReply {
    /// A result with one text content item per entry.
    pub fn text<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let content: Vec<Value> = items
            .into_iter()
            .map(|text| json!({"type": "text", "text": text.into()}))
            .collect();
        Self::Result(json!({ "content": content }))
    }

    pub fn delayed(delay: Duration, text: &str) -> Self {
        Self::Delayed(delay, Box::new(Self::text([text])))
    }
}

/// One message received by the fake server.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: String,
    pub id: Option<Value>,
    pub params: Option<Value>,
}

/// Shared log of received messages.
#[derive(Debug, Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<RecordedRequest>>>);

impl Recorder {
    fn lock(&self) -> MutexGuard<'_, Vec<RecordedRequest>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.lock().iter().map(|r| r.method.clone()).collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.lock().iter().filter(|r| r.method == method).count()
    }

    /// `(name, arguments)` of every `tools/call`, in arrival order.
    pub fn tool_calls(&self) -> Vec<(String, Value)> {
        self.lock()
            .iter()
            .filter(|r| r.method == "tools/call")
            .filter_map(|r| r.params.as_ref())
            .map(|p| {
                let name = p["name"].as_str().unwrap_or_default().to_string();
                (name, p["arguments"].clone())
            })
            .collect()
    }
}

/// Builder for a scripted tool server.
#[derive(Debug, Default)]
pub struct FakeServer {
    tools: Vec<Value>,
    calls: HashMap<String, CallReply>,
    init_error: Option<String>,
    list_error: Option<String>,
    close_before_init: bool,
    log_notifications: bool,
    server_info: Option<Value>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise a tool; `schema: None` omits `inputSchema` entirely.
    pub fn with_tool(mut self, name: &str, description: &str, schema: Option<Value>) -> Self {
        let mut tool = json!({"name": name, "description": description});
        if let Some(schema) = schema {
            tool["inputSchema"] = schema;
        }
        self.tools.push(tool);
        self
    }

    pub fn on_call(mut self, name: &str, reply: CallReply) -> Self {
        self.calls.insert(name.to_string(), reply);
        self
    }

    pub fn fail_initialize(mut self, message: &str) -> Self {
        self.init_error = Some(message.to_string());
        self
    }

    pub fn fail_list(mut self, message: &str) -> Self {
        self.list_error = Some(message.to_string());
        self
    }

    /// Close the pipe as soon as `initialize` arrives.
    pub fn close_before_initialize(mut self) -> Self {
        self.close_before_init = true;
        self
    }

    /// Reply to `initialize` with this result instead of the default.
    pub fn with_initialize_result(mut self, result: Value) -> Self {
        self.server_info = Some(result);
        self
    }

    /// Emit a log notification before every response.
    pub fn with_log_notifications(mut self) -> Self {
        self.log_notifications = true;
        self
    }

    /// Start the server task and connect a [`Session`] to it.
    pub async fn connect(self) -> (Result<Session>, Recorder) {
        let recorder = Recorder::default();
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(self.serve(server, recorder.clone()));

        let (reader, writer) = tokio::io::split(client);
        (Session::connect("fake", reader, writer).await, recorder)
    }

    async fn serve(self, stream: tokio::io::DuplexStream, recorder: Recorder) {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        while let Ok(Some(message)) = read_frame::<_, Value>(&mut reader).await {
            let method = message["method"].as_str().unwrap_or_default().to_string();
            let id = message.get("id").cloned();
            recorder.lock().push(RecordedRequest {
                method: method.clone(),
                id: id.clone(),
                params: message.get("params").cloned(),
            });

            if method == "initialize" && self.close_before_init {
                return;
            }
            let Some(id) = id else {
                continue;
            };

            let mut reply = self.reply_for(&method, &message);
            while let CallReply::Delayed(delay, inner) = reply {
                tokio::time::sleep(delay).await;
                reply = *inner;
            }

            let response = match reply {
                CallReply::Result(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                CallReply::Error(message) => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32000, "message": message}
                }),
                CallReply::WrongId => json!({
                    "jsonrpc": "2.0",
                    "id": "not-a-request",
                    "result": {"content": []}
                }),
                CallReply::Hangup | CallReply::Delayed(..) => return,
            };

            if self.log_notifications {
                let note = json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/message",
                    "params": {"level": "info", "data": "working"}
                });
                if write_frame(&mut writer, &note).await.is_err() {
                    return;
                }
            }
            if write_frame(&mut writer, &response).await.is_err() {
                return;
            }
        }
    }

    fn reply_for(&self, method: &str, message: &Value) -> CallReply {
        match method {
            "initialize" => match &self.init_error {
                Some(error) => CallReply::Error(error.clone()),
                None => CallReply::Result(self.server_info.clone().unwrap_or_else(|| json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake-tools", "version": "0.0.1"}
                }))),
            },
            "tools/list" => match &self.list_error {
                Some(error) => CallReply::Error(error.clone()),
                None => CallReply::Result(json!({ "tools": self.tools })),
            },
            "tools/call" => {
                let name = message["params"]["name"].as_str().unwrap_or_default();
                self.calls
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| CallReply::Error(format!("Unknown tool: {name}")))
            }
            other => CallReply::Error(format!("Method not found: {other}")),
        }
    }
}
