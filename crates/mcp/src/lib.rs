//! Tool-protocol (MCP) client library.
//!
//! This crate provides a client for one tool server speaking
//! newline-delimited JSON-RPC 2.0 over the stdio of a child process.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{ServerConfig, Session};
//!
//! # async fn example() -> mcp::Result<()> {
//! let config = ServerConfig::new("whatsapp", "uv")
//!     .args(["run", "main.py"])
//!     .cwd("../whatsapp-mcp-server");
//!
//! let session = Session::start(config).await?;
//!
//! for tool in session.list_tools().await? {
//!     println!("Tool: {}", tool.name);
//! }
//!
//! let mut arguments = serde_json::Map::new();
//! arguments.insert("name".into(), "Alice".into());
//! let text = session.call_tool("search_contacts", arguments).await?;
//! println!("{text}");
//!
//! session.stop().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod process;
mod protocol;
mod session;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{Error, Result};
pub use process::{ServerConfig, ServerProcess};
pub use protocol::{
    CallToolParams, CallToolResult, ClientInfo, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, ListToolsResult, NO_RESULT,
    PROTOCOL_VERSION, RequestId, ServerInfo, Tool, ToolContent, empty_object_schema,
};
pub use session::Session;
pub use transport::MAX_OUTPUT_SIZE;
