//! Async client library for driving a locally-spawned `claude` CLI process
//! over its line-delimited stream-json control protocol.
//!
//! Two entry points:
//! - [`query`] / [`MessageIterator`] for a single prompt run to its terminal
//!   result (§4.5).
//! - [`Client`] for a long-lived, multi-turn session with hooks, tool
//!   permission callbacks, and runtime control (interrupt, model/permission
//!   switches, file rewind) (§4.6).
//!
//! [`with_client`] wraps the latter in connect/disconnect bracketing.
//!
//! This crate shells out to a locally installed `claude` binary; it does not
//! implement MCP server wiring, SDK-side tool execution, or CLI packaging
//! (§1 non-goals).

mod cli;
mod client;
mod control;
mod error;
mod hooks;
mod mcp_bridge;
mod options;
mod parser;
mod query;
mod transport;
mod types;

pub use client::{with_client, with_client_transport, Client, MessageStream};
pub use error::{Error, Result};
pub use hooks::HookProcessor;
pub use mcp_bridge::{McpBridge, McpServerRegistry, NoMcpBridge};
pub use options::{
    CanUseTool, ClaudeAgentOptions, ClaudeAgentOptionsBuilder, HookCallback, HookContext,
    HookEvent, HookInput, HookMatcher, PermissionMode, PermissionResult, PluginConfig,
    ToolPermissionContext, DEFAULT_CONTROL_TIMEOUT, DEFAULT_MAX_BUFFER_SIZE,
};
pub use parser::Parser;
pub use query::MessageIterator;
pub use transport::{SubprocessTransport, Transport};
pub use types::{
    AssistantMessage, ContentBlock, Message, ResultMessage, StreamEvent, SystemMessage,
    UserMessage,
};

/// Runs a single prompt to completion, returning its [`MessageIterator`]
/// (§4.5). The subprocess is spawned lazily on the first call to `next()`.
pub fn query(
    prompt: impl Into<String>,
    options: ClaudeAgentOptions,
) -> Result<MessageIterator> {
    MessageIterator::new(prompt, options)
}
