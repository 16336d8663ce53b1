//! Tool server session: handshake, correlated requests, tool catalog cache.

use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{Mutex, OnceCell};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::process::{ServerConfig, ServerProcess};
use crate::protocol::{
    CallToolParams, CallToolResult, ClientInfo, InitializeParams, InitializeResult,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, ListToolsResult, NO_RESULT, RequestId,
    Tool,
};
use crate::transport::{read_frame, write_frame};

type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The byte streams plus the id counter. Only one exchange at a time may
/// hold it, which keeps exactly one request in flight.
struct Channel {
    reader: BoxedReader,
    writer: BoxedWriter,
    next_id: i64,
    closed: bool,
}

impl Channel {
    fn new(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader,
            writer,
            next_id: 0,
            closed: false,
        }
    }

    fn next_request_id(&mut self) -> RequestId {
        self.next_id += 1;
        RequestId::Number(self.next_id)
    }

    /// Send one request and read its response.
    async fn exchange(&mut self, method: &str, params: Option<Value>) -> Result<JsonRpcMessage> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }

        let id = self.next_request_id();
        let request = JsonRpcRequest {
            params,
            ..JsonRpcRequest::new(id.clone(), method)
        };
        debug!(%id, method, "sending request");
        self.send(&request).await?;

        loop {
            let message: JsonRpcMessage = match read_frame(&mut self.reader).await? {
                Some(message) => message,
                None => {
                    self.closed = true;
                    return Err(Error::ConnectionClosed);
                }
            };

            if message.is_notification() {
                debug!(method = ?message.method, "skipping server notification");
                continue;
            }

            if message.id.as_ref() != Some(&id) {
                // The real reply is still unread; alignment is lost for good.
                self.closed = true;
                return Err(Error::InvalidResponse(format!(
                    "response ID mismatch: expected {id}, got {:?}",
                    message.id
                )));
            }

            debug!(%id, method, error = message.error.is_some(), "received response");
            return Ok(message);
        }
    }

    async fn notify(&mut self, method: &str) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        debug!(method, "sending notification");
        self.send(&JsonRpcNotification::new(method)).await
    }

    async fn send<T: serde::Serialize>(&mut self, message: &T) -> Result<()> {
        match write_frame(&mut self.writer, message).await {
            Err(Error::Io(e)) if e.kind() == ErrorKind::BrokenPipe => {
                self.closed = true;
                Err(Error::ConnectionClosed)
            }
            other => other,
        }
    }
}

/// A live session with one tool server.
///
/// Created only by a successful handshake, so every method may assume the
/// server is initialized. Share it across tasks with `Arc`; concurrent
/// callers are serialized request by request.
pub struct Session {
    name: String,
    channel: Arc<Mutex<Channel>>,
    process: Mutex<Option<ServerProcess>>,
    server_info: InitializeResult,
    tools: OnceCell<Vec<Tool>>,
    stopped: AtomicBool,
    request_timeout: Option<Duration>,
}

impl Session {
    /// Launch the configured server and perform the handshake.
    ///
    /// Any failure (spawn, error reply, closed output) is reported as
    /// [`Error::ProtocolInit`]; the child is stopped before returning.
    pub async fn start(config: ServerConfig) -> Result<Self> {
        let (mut process, stdin, stdout) = ServerProcess::spawn(&config).map_err(Error::init)?;
        let mut channel = Channel::new(Box::new(BufReader::new(stdout)), Box::new(stdin));

        let server_info =
            match with_timeout(config.request_timeout, handshake(&mut channel)).await {
                Ok(info) => info,
                Err(e) => {
                    warn!(server = %config.name, "handshake failed: {e}");
                    if let Err(stop_err) = process.stop().await {
                        warn!(server = %config.name, "failed to stop server: {stop_err}");
                    }
                    return Err(e);
                }
            };

        Ok(Self::from_parts(
            config.name,
            channel,
            Some(process),
            server_info,
            config.request_timeout,
        ))
    }

    /// Perform the handshake over caller-provided streams.
    ///
    /// Used for in-process servers; there is no child process to stop.
    pub async fn connect<R, W>(name: impl Into<String>, reader: R, writer: W) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let name = name.into();
        let mut channel = Channel::new(Box::new(BufReader::new(reader)), Box::new(writer));
        let server_info = handshake(&mut channel).await?;
        Ok(Self::from_parts(name, channel, None, server_info, None))
    }

    fn from_parts(
        name: String,
        channel: Channel,
        process: Option<ServerProcess>,
        server_info: InitializeResult,
        request_timeout: Option<Duration>,
    ) -> Self {
        info!(
            server = %name,
            remote = ?server_info.server_info.as_ref().map(|s| &s.name),
            protocol = ?server_info.protocol_version,
            "tool server initialized"
        );
        Self {
            name,
            channel: Arc::new(Mutex::new(channel)),
            process: Mutex::new(process),
            server_info,
            tools: OnceCell::new(),
            stopped: AtomicBool::new(false),
            request_timeout,
        }
    }

    /// Limit how long callers wait for each response.
    pub fn with_request_timeout(mut self, limit: Duration) -> Self {
        self.request_timeout = Some(limit);
        self
    }

    /// Get the session name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// What the server reported during `initialize`.
    pub fn server_info(&self) -> &InitializeResult {
        &self.server_info
    }

    /// List the server's tools.
    ///
    /// The first successful fetch is cached for the life of the session;
    /// `tools/list` is sent at most once even under concurrent first calls.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let tools = self
            .tools
            .get_or_try_init(|| async {
                let response = self.request("tools/list", None).await?;
                let result = response
                    .into_result()
                    .map_err(|e| Error::ToolList(e.message))?;
                let list: ListToolsResult = serde_json::from_value(result)
                    .map_err(|e| Error::InvalidResponse(format!("tools/list result: {e}")))?;
                info!(server = %self.name, count = list.tools.len(), "loaded tools");
                Ok::<_, Error>(list.tools)
            })
            .await?;
        Ok(tools.clone())
    }

    /// Call a tool by name and return its text output.
    ///
    /// Text content items are joined by newlines. A result with no content
    /// yields [`NO_RESULT`]; content with no text items yields the raw
    /// result JSON.
    pub async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<String> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;

        let response = self.request("tools/call", Some(params)).await?;
        let result = response
            .into_result()
            .map_err(|e| Error::ToolCall(e.message))?;
        let parsed: CallToolResult = serde_json::from_value(result.clone())
            .map_err(|e| Error::InvalidResponse(format!("tools/call result: {e}")))?;

        if parsed.is_error {
            let message = parsed
                .text()
                .unwrap_or_else(|| format!("tool {name} reported an error"));
            return Err(Error::ToolCall(message));
        }

        if parsed.content.is_empty() {
            return Ok(NO_RESULT.to_string());
        }

        Ok(parsed.text().unwrap_or_else(|| result.to_string()))
    }

    /// Terminate the server process and wait for it to exit.
    ///
    /// Idempotent. Later RPC calls fail with [`Error::Stopped`].
    pub async fn stop(&self) -> Result<()> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!(server = %self.name, "stopping session");
        }
        let mut process = self.process.lock().await;
        match process.as_mut() {
            Some(process) => process.stop().await,
            None => Ok(()),
        }
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run one exchange under the channel gate.
    ///
    /// The gate is taken in the caller's future, so a caller that gives up
    /// while queued never sends anything. Once the gate is held the exchange
    /// runs as its own task; a caller that stops waiting then (drop,
    /// timeout) leaves the task to read and discard the response, so the
    /// next request never sees a stale reply.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcMessage> {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }

        let exchange = async move {
            let mut channel = Arc::clone(&self.channel).lock_owned().await;
            let method = method.to_string();
            tokio::spawn(async move { channel.exchange(&method, params).await })
                .await
                .map_err(|e| Error::InvalidResponse(format!("request task failed: {e}")))?
        };

        match self.request_timeout {
            Some(limit) => timeout(limit, exchange).await.map_err(|_| Error::Timeout)?,
            None => exchange.await,
        }
    }
}

async fn handshake(channel: &mut Channel) -> Result<InitializeResult> {
    let params = serde_json::to_value(InitializeParams::new(ClientInfo::default()))?;
    let response = channel
        .exchange("initialize", Some(params))
        .await
        .map_err(Error::init)?;
    let result = response
        .into_result()
        .map_err(|e| Error::init(format!("server returned error {e}")))?;
    let info = serde_json::from_value(result).unwrap_or_else(|e| {
        warn!("ignoring malformed initialize result: {e}");
        InitializeResult::default()
    });

    channel
        .notify("notifications/initialized")
        .await
        .map_err(Error::init)?;
    Ok(info)
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(limit) => timeout(limit, fut)
            .await
            .map_err(|_| Error::init("timed out waiting for initialize response"))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CallReply, FakeServer};
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn handshake_sends_initialize_then_notification() {
        let (session, recorder) = FakeServer::new().connect().await;
        let session = session.unwrap();
        // A round trip guarantees the notification has been read.
        session.list_tools().await.unwrap();

        let requests = recorder.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].method, "initialize");
        assert_eq!(requests[0].id, Some(json!(1)));
        assert_eq!(requests[0].params.as_ref().unwrap()["protocolVersion"], "2024-11-05");
        assert_eq!(requests[1].method, "notifications/initialized");
        assert_eq!(requests[1].id, None);
        assert_eq!(
            session.server_info().server_info.as_ref().unwrap().name,
            "fake-tools"
        );
    }

    #[tokio::test]
    async fn closed_output_before_handshake_is_init_error() {
        let (session, recorder) = FakeServer::new().close_before_initialize().connect().await;
        assert!(matches!(session, Err(Error::ProtocolInit { .. })));
        assert_eq!(recorder.methods(), vec!["initialize"]);
    }

    #[tokio::test]
    async fn handshake_error_reply_is_init_error() {
        let (session, recorder) = FakeServer::new()
            .fail_initialize("unsupported protocol")
            .connect()
            .await;
        let err = session.err().unwrap();
        assert!(matches!(err, Error::ProtocolInit { .. }));
        assert!(err.to_string().contains("unsupported protocol"));
        // No initialized notification after a failed handshake.
        assert_eq!(recorder.methods(), vec!["initialize"]);
    }

    #[tokio::test]
    async fn list_tools_is_cached() {
        let (session, recorder) = FakeServer::new()
            .with_tool("search_contacts", "Search contacts by name", None)
            .with_tool("send_message", "Send a message", Some(json!({"type": "object"})))
            .connect()
            .await;
        let session = session.unwrap();

        let first = session.list_tools().await.unwrap();
        let second = session.list_tools().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].name, "search_contacts");
        assert_eq!(first[0].input_schema, crate::protocol::empty_object_schema());
        assert_eq!(first[1].input_schema, json!({"type": "object"}));
        assert_eq!(recorder.count("tools/list"), 1);
    }

    #[tokio::test]
    async fn concurrent_first_list_sends_one_request() {
        let (session, recorder) = FakeServer::new()
            .with_tool("list_chats", "", None)
            .connect()
            .await;
        let session = Arc::new(session.unwrap());

        let a = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.list_tools().await }
        });
        let b = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.list_tools().await }
        });
        assert_eq!(a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(recorder.count("tools/list"), 1);
    }

    #[tokio::test]
    async fn list_tools_error_is_not_cached() {
        let (session, recorder) = FakeServer::new().fail_list("db locked").connect().await;
        let session = session.unwrap();

        let err = session.list_tools().await.unwrap_err();
        assert!(matches!(err, Error::ToolList(ref m) if m == "db locked"));
        let _ = session.list_tools().await;
        assert_eq!(recorder.count("tools/list"), 2);
    }

    #[tokio::test]
    async fn call_tool_joins_text_content() {
        let (session, recorder) = FakeServer::new()
            .on_call("search_contacts", CallReply::text(["Alice Smith", "+1555"]))
            .connect()
            .await;
        let session = session.unwrap();

        let out = session
            .call_tool("search_contacts", args(json!({"name": "Alice"})))
            .await
            .unwrap();
        assert_eq!(out, "Alice Smith\n+1555");

        let calls = recorder.tool_calls();
        assert_eq!(calls, vec![("search_contacts".to_string(), json!({"name": "Alice"}))]);
    }

    #[tokio::test]
    async fn call_tool_empty_content_is_no_result() {
        let (session, _) = FakeServer::new()
            .on_call("noop", CallReply::Result(json!({"content": []})))
            .connect()
            .await;
        let out = session.unwrap().call_tool("noop", Map::new()).await.unwrap();
        assert_eq!(out, NO_RESULT);
    }

    #[tokio::test]
    async fn call_tool_without_text_returns_raw_result() {
        let raw = json!({"content": [{"type": "image", "data": "AA", "mimeType": "image/png"}]});
        let (session, _) = FakeServer::new()
            .on_call("snapshot", CallReply::Result(raw.clone()))
            .connect()
            .await;
        let out = session.unwrap().call_tool("snapshot", Map::new()).await.unwrap();
        assert_eq!(serde_json::from_str::<Value>(&out).unwrap(), raw);
    }

    #[tokio::test]
    async fn call_tool_error_reply_carries_message() {
        let (session, _) = FakeServer::new()
            .on_call("send_message", CallReply::Error("recipient not found".into()))
            .connect()
            .await;
        let err = session
            .unwrap()
            .call_tool("send_message", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolCall(ref m) if m == "recipient not found"));
    }

    #[tokio::test]
    async fn call_tool_is_error_flag_is_failure() {
        let (session, _) = FakeServer::new()
            .on_call(
                "send_message",
                CallReply::Result(json!({
                    "content": [{"type": "text", "text": "not connected"}],
                    "isError": true
                })),
            )
            .connect()
            .await;
        let err = session
            .unwrap()
            .call_tool("send_message", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolCall(ref m) if m == "not connected"));
    }

    #[tokio::test]
    async fn request_ids_increase_and_notifications_are_skipped() {
        let (session, recorder) = FakeServer::new()
            .with_tool("a", "", None)
            .on_call("a", CallReply::text(["ok"]))
            .with_log_notifications()
            .connect()
            .await;
        let session = session.unwrap();

        session.list_tools().await.unwrap();
        assert_eq!(session.call_tool("a", Map::new()).await.unwrap(), "ok");
        assert_eq!(session.call_tool("a", Map::new()).await.unwrap(), "ok");

        let ids: Vec<Value> = recorder
            .requests()
            .into_iter()
            .filter_map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn closed_stream_mid_session_is_fatal() {
        let (session, _) = FakeServer::new()
            .on_call("crash", CallReply::Hangup)
            .connect()
            .await;
        let session = session.unwrap();

        let err = session.call_tool("crash", Map::new()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(err.is_fatal());

        let err = session.list_tools().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn timed_out_response_is_drained_before_next_request() {
        let (session, _) = FakeServer::new()
            .on_call("slow", CallReply::delayed(Duration::from_millis(200), "late"))
            .on_call("fast", CallReply::text(["quick"]))
            .connect()
            .await;
        let mut session = session.unwrap().with_request_timeout(Duration::from_millis(50));

        let err = session.call_tool("slow", Map::new()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));

        // Waits for the stale exchange to finish, then gets its own reply.
        session.request_timeout = None;
        assert_eq!(session.call_tool("fast", Map::new()).await.unwrap(), "quick");
    }

    #[tokio::test]
    async fn queued_request_that_times_out_is_never_sent() {
        let (session, recorder) = FakeServer::new()
            .on_call("slow", CallReply::delayed(Duration::from_millis(300), "late"))
            .on_call("send_message", CallReply::text(["sent"]))
            .connect()
            .await;
        let session = Arc::new(
            session
                .unwrap()
                .with_request_timeout(Duration::from_millis(100)),
        );

        let slow = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.call_tool("slow", Map::new()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = session
            .call_tool("send_message", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(matches!(slow.await.unwrap(), Err(Error::Timeout)));

        // Once the slow exchange has drained, the gate is free again.
        tokio::time::sleep(Duration::from_millis(350)).await;
        session.list_tools().await.unwrap();
        assert_eq!(recorder.tool_calls(), vec![("slow".to_string(), json!({}))]);
    }

    #[tokio::test]
    async fn queued_request_dropped_by_caller_is_never_sent() {
        let (session, recorder) = FakeServer::new()
            .on_call("slow", CallReply::delayed(Duration::from_millis(100), "late"))
            .on_call("send_message", CallReply::text(["sent"]))
            .connect()
            .await;
        let session = Arc::new(session.unwrap());

        let slow = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.call_tool("slow", Map::new()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(30),
            session.call_tool("send_message", Map::new()),
        )
        .await;
        assert!(abandoned.is_err());

        assert_eq!(slow.await.unwrap().unwrap(), "late");
        session.list_tools().await.unwrap();
        assert_eq!(recorder.tool_calls(), vec![("slow".to_string(), json!({}))]);
    }

    #[tokio::test]
    async fn concurrent_calls_each_get_their_own_reply() {
        let (session, recorder) = FakeServer::new()
            .on_call("slow", CallReply::delayed(Duration::from_millis(50), "late"))
            .on_call("fast", CallReply::text(["quick"]))
            .connect()
            .await;
        let session = Arc::new(session.unwrap());

        let slow = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.call_tool("slow", Map::new()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let fast = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.call_tool("fast", Map::new()).await }
        });

        assert_eq!(fast.await.unwrap().unwrap(), "quick");
        assert_eq!(slow.await.unwrap().unwrap(), "late");

        // The second request was only written after the first was answered.
        let calls: Vec<(Option<Value>, String)> = recorder
            .requests()
            .into_iter()
            .filter(|r| r.method == "tools/call")
            .map(|r| (r.id, r.params.unwrap_or_default()["name"].to_string()))
            .collect();
        assert_eq!(
            calls,
            vec![
                (Some(json!(2)), "\"slow\"".to_string()),
                (Some(json!(3)), "\"fast\"".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn id_mismatch_closes_session() {
        let (session, recorder) = FakeServer::new()
            .on_call("confused", CallReply::WrongId)
            .on_call("a", CallReply::text(["ok"]))
            .connect()
            .await;
        let session = session.unwrap();

        let err = session.call_tool("confused", Map::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(ref m) if m.contains("mismatch")));

        let err = session.call_tool("a", Map::new()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert_eq!(recorder.count("tools/call"), 1);
    }

    #[tokio::test]
    async fn malformed_initialize_result_is_tolerated() {
        let (session, _) = FakeServer::new()
            .with_initialize_result(json!({"serverInfo": {"version": "1.0"}}))
            .connect()
            .await;
        let session = session.unwrap();
        assert_eq!(session.server_info(), &InitializeResult::default());
        assert!(session.list_tools().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rpc_after_stop_fails() {
        let (session, recorder) = FakeServer::new().with_tool("a", "", None).connect().await;
        let session = session.unwrap();

        session.stop().await.unwrap();
        session.stop().await.unwrap();
        assert!(session.is_stopped());

        let err = session.list_tools().await.unwrap_err();
        assert!(matches!(err, Error::Stopped));
        assert_eq!(recorder.count("tools/list"), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_fails_when_process_exits_before_handshake() {
        let config = ServerConfig::new("silent", "true");
        let err = Session::start(config).await.err().unwrap();
        assert!(matches!(err, Error::ProtocolInit { .. }));
    }

    #[tokio::test]
    async fn start_fails_when_binary_is_missing() {
        let config = ServerConfig::new("missing", "/nonexistent/chatline-tool-server");
        let err = Session::start(config).await.err().unwrap();
        assert!(matches!(err, Error::ProtocolInit { .. }));
    }
}
