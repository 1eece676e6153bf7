//! Wire types shared across the overpass workspace.
//!
//! This crate is deliberately IO-free: it defines the Anthropic-compatible
//! request/response shapes the proxy speaks with its client, the tool-call
//! and tool-result values that flow through the agent loop, and the turn
//! records persisted per session.

mod messages;
mod termination;
mod tools;
mod turns;

pub use messages::ContentBlock;
pub use messages::Message;
pub use messages::MessagesRequest;
pub use messages::MessagesResponse;
pub use messages::StopReason;
pub use messages::ToolDefinition;
pub use messages::Usage;
pub use termination::TerminationReason;
pub use tools::ToolCall;
pub use tools::ToolError;
pub use tools::ToolResult;
pub use turns::Turn;
pub use turns::TurnRole;
