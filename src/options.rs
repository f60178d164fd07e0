//! Session configuration: [`ClaudeAgentOptions`], its builder, and the
//! closed-set enums and callback traits that drive the hook processor (§4.2)
//! and streaming client option validation (§4.6).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::mcp_bridge::McpBridge;

/// Closed set of permission modes (§4.6 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

impl Default for PermissionMode {
    fn default() -> Self {
        PermissionMode::Default
    }
}

/// Closed set of hook events (§4.2). Unknown events decode to `Other` so a
/// forward-compatible agent can still send us descriptors we don't act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    PostToolUseFailure,
    UserPromptSubmit,
    Stop,
    SubagentStop,
    SubagentStart,
    PreCompact,
    Notification,
    PermissionRequest,
}

/// A matcher paired with the callbacks it fires for one [`HookEvent`].
#[derive(Clone)]
pub struct HookMatcher {
    /// Tool-name glob, or `None` to match every invocation of this event.
    pub matcher: Option<String>,
    pub callbacks: Vec<std::sync::Arc<dyn HookCallback>>,
    pub timeout: Option<Duration>,
}

/// Raw input handed to a hook callback: the agent's payload verbatim plus
/// whatever `tool_use_id` accompanied it.
#[derive(Debug, Clone, Default)]
pub struct HookInput {
    pub event: HookEvent,
    pub payload: Map<String, Value>,
    pub tool_use_id: Option<String>,
}

impl Default for HookEvent {
    fn default() -> Self {
        HookEvent::Notification
    }
}

/// Cancellation/session context threaded through to a hook invocation.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub cancel: Option<tokio_util::sync::CancellationToken>,
}

/// A registered hook callback. Implementations MUST be safe to invoke
/// concurrently across distinct inbound control requests (§4.2).
#[async_trait]
pub trait HookCallback: Send + Sync {
    /// Returns the map that is passed through verbatim as the `response`
    /// field of the matching `control_response`.
    async fn call(&self, input: HookInput, context: HookContext) -> Map<String, Value>;
}

/// Context passed to a [`CanUseTool`] callback alongside the tool name and
/// input the agent wants to invoke.
#[derive(Debug, Clone, Default)]
pub struct ToolPermissionContext {
    pub suggestions: Vec<Value>,
}

/// Outcome of a tool-permission decision (§4.2).
#[derive(Debug, Clone)]
pub enum PermissionResult {
    Allow {
        /// Replaces the tool input the agent proposed. `None` defaults to
        /// the original input at translation time.
        updated_input: Option<Map<String, Value>>,
        updated_permissions: Option<Vec<Value>>,
    },
    Deny {
        message: String,
        interrupt: bool,
    },
}

impl PermissionResult {
    pub fn allow() -> Self {
        PermissionResult::Allow {
            updated_input: None,
            updated_permissions: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        PermissionResult::Deny {
            message: message.into(),
            interrupt: false,
        }
    }
}

/// The single, optional, per-session tool-permission callback (§4.2).
#[async_trait]
pub trait CanUseTool: Send + Sync {
    async fn check(
        &self,
        tool_name: String,
        input: Map<String, Value>,
        context: ToolPermissionContext,
    ) -> PermissionResult;
}

/// Plugin source types accepted by `--agents`. Only `Local` has a defined
/// wire shape in this crate; everything else is rejected by the one-shot
/// query constructor (§4.5).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginConfig {
    Local { path: PathBuf },
    #[serde(other)]
    Other,
}

/// Session-wide configuration. Construct via [`ClaudeAgentOptionsBuilder`].
#[derive(Default, Clone)]
pub struct ClaudeAgentOptions {
    pub binary: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub model: Option<String>,
    pub fallback_model: Option<String>,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub permission_mode: PermissionMode,
    pub permission_prompt_tool_name: Option<String>,
    pub can_use_tool: Option<std::sync::Arc<dyn CanUseTool>>,
    pub hooks: HashMap<HookEvent, Vec<HookMatcher>>,
    /// In-process SDK-MCP servers, keyed by the name the agent addresses
    /// `mcp_message` control requests to (§4.3, §4.4.5 shim). A non-empty
    /// map, like a non-empty `hooks`, forces the stdin pipe to stay open
    /// for the life of the session.
    pub mcp_servers: HashMap<String, std::sync::Arc<dyn McpBridge>>,
    pub include_partial_messages: bool,
    pub max_buffer_size: usize,
    pub enable_file_checkpointing: bool,
    pub stream_close_timeout: Option<Duration>,
    pub add_dirs: Vec<PathBuf>,
    pub plugins: Vec<PluginConfig>,
    pub extra_args: Vec<String>,
}

/// Default buffer cap for the parser (§4.1): 1 MiB.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Default control-protocol / stdin-closure timeout (§4.3, §4.4.5): 60 s.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(60);

impl ClaudeAgentOptions {
    pub fn builder() -> ClaudeAgentOptionsBuilder {
        ClaudeAgentOptionsBuilder::default()
    }

    /// Validates the constraints shared by every public construction site
    /// (§4.6 option validation, reused by the one-shot query and the
    /// streaming client).
    pub fn validate(&self) -> Result<()> {
        if self.can_use_tool.is_some() && self.permission_prompt_tool_name.is_some() {
            return Err(Error::InvalidRequest(
                "can_use_tool is incompatible with permission_prompt_tool_name".into(),
            ));
        }
        Ok(())
    }

    /// `CanUseTool` set implies `permission_prompt_tool_name = "stdio"`
    /// (§4.6); returns a clone with that applied, matching the streaming
    /// client's "clone options to apply transparently" behavior.
    pub fn with_stdio_permission_prompt(&self) -> Self {
        let mut clone = self.clone();
        if clone.can_use_tool.is_some() {
            clone.permission_prompt_tool_name = Some("stdio".to_string());
        }
        clone
    }

    /// Explicit builder value, then `CLAUDE_CODE_STREAM_CLOSE_TIMEOUT`
    /// (milliseconds), then the 60s default (§4.3, §4.4.5, §6.2).
    pub fn stream_close_timeout(&self) -> Duration {
        if let Some(timeout) = self.stream_close_timeout {
            return timeout;
        }
        if let Some(ms) = std::env::var("CLAUDE_CODE_STREAM_CLOSE_TIMEOUT")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
        {
            return Duration::from_millis(ms);
        }
        DEFAULT_CONTROL_TIMEOUT
    }
}

/// Consuming builder for [`ClaudeAgentOptions`], in the teacher's
/// `ClaudeClientBuilder` style.
#[derive(Default)]
pub struct ClaudeAgentOptionsBuilder {
    opts: ClaudeAgentOptions,
}

impl ClaudeAgentOptionsBuilder {
    pub fn binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.opts.binary = Some(path.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.opts.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.opts.env.insert(key.into(), value.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.opts.model = Some(model.into());
        self
    }

    pub fn fallback_model(mut self, model: impl Into<String>) -> Self {
        self.opts.fallback_model = Some(model.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.opts.system_prompt = Some(prompt.into());
        self
    }

    pub fn append_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.opts.append_system_prompt = Some(prompt.into());
        self
    }

    pub fn allowed_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.opts.allowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn disallowed_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.opts.disallowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn permission_mode(mut self, mode: PermissionMode) -> Self {
        self.opts.permission_mode = mode;
        self
    }

    pub fn permission_prompt_tool_name(mut self, name: impl Into<String>) -> Self {
        self.opts.permission_prompt_tool_name = Some(name.into());
        self
    }

    pub fn can_use_tool(mut self, callback: std::sync::Arc<dyn CanUseTool>) -> Self {
        self.opts.can_use_tool = Some(callback);
        self
    }

    pub fn hook(mut self, event: HookEvent, matcher: HookMatcher) -> Self {
        self.opts.hooks.entry(event).or_default().push(matcher);
        self
    }

    pub fn mcp_server(
        mut self,
        name: impl Into<String>,
        bridge: std::sync::Arc<dyn McpBridge>,
    ) -> Self {
        self.opts.mcp_servers.insert(name.into(), bridge);
        self
    }

    pub fn include_partial_messages(mut self, include: bool) -> Self {
        self.opts.include_partial_messages = include;
        self
    }

    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.opts.max_buffer_size = size;
        self
    }

    pub fn enable_file_checkpointing(mut self, enable: bool) -> Self {
        self.opts.enable_file_checkpointing = enable;
        self
    }

    pub fn stream_close_timeout(mut self, timeout: Duration) -> Self {
        self.opts.stream_close_timeout = Some(timeout);
        self
    }

    pub fn add_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.opts.add_dirs.push(dir.into());
        self
    }

    pub fn plugin(mut self, plugin: PluginConfig) -> Self {
        self.opts.plugins.push(plugin);
        self
    }

    pub fn extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.opts.extra_args.push(arg.into());
        self
    }

    pub fn build(mut self) -> Result<ClaudeAgentOptions> {
        if self.opts.max_buffer_size == 0 {
            self.opts.max_buffer_size = DEFAULT_MAX_BUFFER_SIZE;
        }
        self.opts.validate()?;
        Ok(self.opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_permission_mode_is_default() {
        assert_eq!(PermissionMode::default(), PermissionMode::Default);
    }

    #[test]
    fn build_fills_default_buffer_size() {
        let opts = ClaudeAgentOptions::builder().build().unwrap();
        assert_eq!(opts.max_buffer_size, DEFAULT_MAX_BUFFER_SIZE);
    }

    struct Noop;

    #[async_trait]
    impl CanUseTool for Noop {
        async fn check(
            &self,
            _tool_name: String,
            _input: Map<String, Value>,
            _context: ToolPermissionContext,
        ) -> PermissionResult {
            PermissionResult::allow()
        }
    }

    #[test]
    fn can_use_tool_conflicts_with_permission_prompt_tool_name() {
        let opts = ClaudeAgentOptions::builder()
            .can_use_tool(std::sync::Arc::new(Noop))
            .permission_prompt_tool_name("custom")
            .build();
        assert!(opts.is_err());
    }

    #[test]
    fn with_stdio_permission_prompt_sets_stdio_when_can_use_tool_present() {
        let opts = ClaudeAgentOptions {
            can_use_tool: Some(std::sync::Arc::new(Noop)),
            ..Default::default()
        };
        let applied = opts.with_stdio_permission_prompt();
        assert_eq!(applied.permission_prompt_tool_name.as_deref(), Some("stdio"));
    }

    #[test]
    fn stream_close_timeout_defaults_to_sixty_seconds() {
        // SAFETY: test-only, single-threaded env mutation scoped to this test.
        unsafe {
            std::env::remove_var("CLAUDE_CODE_STREAM_CLOSE_TIMEOUT");
        }
        let opts = ClaudeAgentOptions::default();
        assert_eq!(opts.stream_close_timeout(), DEFAULT_CONTROL_TIMEOUT);
    }

    #[test]
    fn stream_close_timeout_honors_env_var_when_unset_explicitly() {
        // SAFETY: test-only, single-threaded env mutation scoped to this test.
        unsafe {
            std::env::set_var("CLAUDE_CODE_STREAM_CLOSE_TIMEOUT", "1500");
        }
        let opts = ClaudeAgentOptions::default();
        assert_eq!(opts.stream_close_timeout(), Duration::from_millis(1500));
        unsafe {
            std::env::remove_var("CLAUDE_CODE_STREAM_CLOSE_TIMEOUT");
        }
    }

    #[test]
    fn stream_close_timeout_explicit_value_wins_over_env_var() {
        // SAFETY: test-only, single-threaded env mutation scoped to this test.
        unsafe {
            std::env::set_var("CLAUDE_CODE_STREAM_CLOSE_TIMEOUT", "1500");
        }
        let opts = ClaudeAgentOptions {
            stream_close_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        assert_eq!(opts.stream_close_timeout(), Duration::from_secs(5));
        unsafe {
            std::env::remove_var("CLAUDE_CODE_STREAM_CLOSE_TIMEOUT");
        }
    }
}
