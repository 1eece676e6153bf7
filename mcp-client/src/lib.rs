//! A minimal async client for the Model Context Protocol (MCP).
//!
//! The client speaks JSON-RPC 2.0 over a child process's stdio, one JSON
//! object per line. It is only capable of:
//!   1. Spawning a subprocess that launches a conforming MCP server.
//!   2. Sending requests and pairing them with their responses by id.
//!   3. Surfacing server-initiated notifications to subscribers.
//!
//! Stdio is the only supported transport.

mod client;
mod types;

pub use client::McpClient;
pub use client::McpClientError;
pub use types::JSONRPC_VERSION;
pub use types::JsonRpcError;
pub use types::JsonRpcErrorBody;
pub use types::JsonRpcMessage;
pub use types::JsonRpcNotification;
pub use types::JsonRpcRequest;
pub use types::JsonRpcResponse;
