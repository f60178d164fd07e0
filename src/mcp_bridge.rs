//! Bridge to an in-process SDK-MCP server (§4.3 `mcp_message` routing).
//!
//! Full SDK-MCP server support (tool registration, schema advertisement) is
//! out of scope (§1); this crate only needs somewhere real to route
//! `control_request { subtype: "mcp_message" }` frames to.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};

/// An in-process MCP server a caller can register to answer
/// `mcp_message` control requests without a real subprocess.
#[async_trait]
pub trait McpBridge: Send + Sync {
    async fn handle_message(&self, server_name: &str, message: Value) -> Result<Value>;
}

/// Default bridge used when no SDK-MCP server is configured: every message
/// fails with a "not found" error, matching the agent's own behavior when it
/// addresses an unregistered server name.
#[derive(Debug, Default)]
pub struct NoMcpBridge;

#[async_trait]
impl McpBridge for NoMcpBridge {
    async fn handle_message(&self, server_name: &str, _message: Value) -> Result<Value> {
        Err(Error::ControlProtocol(format!(
            "MCP server '{server_name}' not found"
        )))
    }
}

/// Dispatches an `mcp_message` to the in-process SDK-MCP server registered
/// under its `server_name`, so a session declaring several via
/// [`ClaudeAgentOptions::mcp_servers`](crate::ClaudeAgentOptions::mcp_servers)
/// can still be routed through the single `mcp_bridge` slot `ControlProtocol`
/// expects. Unregistered names fail exactly like [`NoMcpBridge`].
#[derive(Clone, Default)]
pub struct McpServerRegistry {
    servers: HashMap<String, Arc<dyn McpBridge>>,
}

impl McpServerRegistry {
    pub fn new(servers: HashMap<String, Arc<dyn McpBridge>>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl McpBridge for McpServerRegistry {
    async fn handle_message(&self, server_name: &str, message: Value) -> Result<Value> {
        match self.servers.get(server_name) {
            Some(bridge) => bridge.handle_message(server_name, message).await,
            None => Err(Error::ControlProtocol(format!(
                "MCP server '{server_name}' not found"
            ))),
        }
    }
}
