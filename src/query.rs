//! One-shot query iterator (C5): runs a single prompt to its terminal
//! `ResultMessage`, then shuts down (§4.5).

use std::sync::Arc;

use serde_json::json;

use crate::cli::{build_argv, resolve_binary};
use crate::error::{Error, Result};
use crate::hooks::HookProcessor;
use crate::options::{ClaudeAgentOptions, PluginConfig};
use crate::transport::SubprocessTransport;
use crate::types::Message;

/// Lazily-connecting iterator over the messages of one prompt. The first
/// call to [`MessageIterator::next`] connects the transport; subsequent
/// calls surface either parsed messages or queued diagnostic errors.
pub struct MessageIterator {
    prompt: String,
    transport: Arc<SubprocessTransport>,
    started: bool,
    done: bool,
    closed: bool,
}

impl MessageIterator {
    /// Constructs the iterator without connecting. Rejects option
    /// combinations that require streaming mode (§4.5).
    pub fn new(prompt: impl Into<String>, options: ClaudeAgentOptions) -> Result<Self> {
        if options.can_use_tool.is_some() {
            return Err(Error::InvalidRequest(
                "can_use_tool requires streaming mode".to_string(),
            ));
        }
        if options
            .plugins
            .iter()
            .any(|p| !matches!(p, PluginConfig::Local { .. }))
        {
            return Err(Error::InvalidRequest(
                "one-shot query only accepts local plugin types".to_string(),
            ));
        }

        let binary = resolve_binary(&options);
        let argv = build_argv(&options, None);
        let keep_stdin_open = !options.hooks.is_empty() || !options.mcp_servers.is_empty();
        let hooks = Arc::new(HookProcessor::new(None));
        let transport = Arc::new(SubprocessTransport::new(
            &options, binary, argv, false, true, keep_stdin_open, hooks,
        ));

        Ok(Self {
            prompt: prompt.into(),
            transport,
            started: false,
            done: false,
            closed: false,
        })
    }

    async fn start(&mut self) -> Result<()> {
        self.transport.connect().await?;

        let message = json!({
            "type": "user",
            "message": { "role": "user", "content": self.prompt },
            "session_id": "",
        });
        self.transport.send_message(&message).await?;

        if self.transport.keeps_stdin_open() {
            SubprocessTransport::defer_stdin_close(&self.transport);
        } else {
            self.transport.end_input().await?;
        }

        self.started = true;
        Ok(())
    }

    /// Returns the next message, `Err(Error::NoMoreMessages)` once stdout
    /// has closed (§4.5). Surfaces queued diagnostic errors ahead of the
    /// next parsed message so a failing session fails loudly rather than
    /// silently truncating.
    pub async fn next(&mut self) -> Result<Message> {
        if self.done {
            return Err(Error::NoMoreMessages);
        }
        if !self.started {
            self.start().await?;
        }

        if let Some(err) = self.transport.next_error().await {
            return Err(err);
        }

        match self.transport.next_message().await {
            Some(message) => {
                if message.is_result() {
                    self.done = true;
                }
                Ok(message)
            }
            None => {
                self.done = true;
                Err(Error::NoMoreMessages)
            }
        }
    }

    /// Idempotent; invokes the transport's `close` exactly once.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.done = true;
        if !self.started {
            return Ok(());
        }
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_can_use_tool_in_one_shot_mode() {
        struct AlwaysAllow;
        #[async_trait::async_trait]
        impl crate::options::CanUseTool for AlwaysAllow {
            async fn check(
                &self,
                _tool_name: String,
                _input: serde_json::Map<String, serde_json::Value>,
                _context: crate::options::ToolPermissionContext,
            ) -> crate::options::PermissionResult {
                crate::options::PermissionResult::allow()
            }
        }
        let options = ClaudeAgentOptions {
            can_use_tool: Some(Arc::new(AlwaysAllow)),
            ..Default::default()
        };
        let err = MessageIterator::new("hi", options).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn rejects_non_local_plugin_types() {
        let options = ClaudeAgentOptions {
            plugins: vec![PluginConfig::Other],
            ..Default::default()
        };
        let err = MessageIterator::new("hi", options).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }
}
