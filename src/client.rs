//! Streaming client (C6): a multi-turn session with runtime control (§4.6),
//! plus the resource-scoped `with_client` / `with_client_transport` helpers
//! (§4.7).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};

use crate::cli::{build_argv, resolve_binary};
use crate::error::{Error, Result};
use crate::hooks::HookProcessor;
use crate::options::{ClaudeAgentOptions, PermissionMode};
use crate::transport::{SubprocessTransport, Transport};
use crate::types::{Message, SystemMessage};

/// How a [`Client`] obtains the transport it drives. `Spawn` is what
/// [`Client::new`] builds: a fresh [`SubprocessTransport`] per `connect()`
/// call, mirroring a real reconnect spawning a new child process. `Given`
/// is what [`Client::from_transport`] builds for a caller-supplied
/// transport (a fake, in tests, or any other [`Transport`] impl) — the
/// same instance is reused across every `connect()`.
enum ClientSource<T: Transport> {
    Spawn(Box<dyn Fn() -> T + Send + Sync>),
    Given(Arc<T>),
}

/// Multi-turn session. A single `RwLock` guards connection state and the
/// transport reference (§4.6 concurrency); reads (queries, runtime control)
/// take the read lock, `connect`/`disconnect` take the write lock.
///
/// Generic over the [`Transport`] it drives, defaulting to
/// [`SubprocessTransport`]. Most callers only ever see `Client<SubprocessTransport>`
/// via [`Client::new`]; the type parameter exists so [`Client::from_transport`]
/// can substitute a fake transport in tests (§4.7).
pub struct Client<T: Transport = SubprocessTransport> {
    source: ClientSource<T>,
    transport: RwLock<Option<Arc<T>>>,
}

impl Client<SubprocessTransport> {
    /// Validates option conflicts and applies the `CanUseTool` implied
    /// `permission_prompt_tool_name = "stdio"` rewrite (§4.6). Each
    /// `connect()` spawns a brand-new agent process from `options`.
    pub fn new(options: ClaudeAgentOptions) -> Result<Self> {
        options.validate()?;
        let options = if options.can_use_tool.is_some() {
            options.with_stdio_permission_prompt()
        } else {
            options
        };
        let source = ClientSource::Spawn(Box::new(move || {
            let binary = resolve_binary(&options);
            let argv = build_argv(&options, None);
            let hooks = Arc::new(HookProcessor::new(options.can_use_tool.clone()));
            SubprocessTransport::new(&options, binary, argv, true, true, false, hooks)
        }));
        Ok(Self {
            source,
            transport: RwLock::new(None),
        })
    }
}

impl<T: Transport> Client<T> {
    /// Drives an already-constructed transport instead of spawning one from
    /// options (§4.7). The same transport instance is reused across
    /// reconnects, so it must support being connected again after a
    /// `disconnect()` if the caller intends to reconnect.
    pub fn from_transport(transport: Arc<T>) -> Self {
        Self {
            source: ClientSource::Given(transport),
            transport: RwLock::new(None),
        }
    }

    /// Idempotent in the Python sense: tears down an existing connection
    /// first, then reconnects and emits each initial prompt.
    pub async fn connect(&self, initial_prompts: Vec<String>) -> Result<()> {
        self.disconnect().await?;

        let transport = match &self.source {
            ClientSource::Spawn(spawn) => Arc::new(spawn()),
            ClientSource::Given(transport) => Arc::clone(transport),
        };
        transport.connect().await?;
        *self.transport.write().await = Some(Arc::clone(&transport));

        for prompt in initial_prompts {
            Self::send_user_message(&transport, prompt, None).await?;
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        let transport = self.transport.write().await.take();
        if let Some(transport) = transport {
            transport.close().await?;
        }
        Ok(())
    }

    async fn transport(&self) -> Result<Arc<T>> {
        self.transport.read().await.clone().ok_or(Error::NotConnected)
    }

    async fn send_user_message(
        transport: &Arc<T>,
        text: String,
        session_id: Option<String>,
    ) -> Result<()> {
        let session_id = session_id
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "default".to_string());
        let message = json!({
            "type": "user",
            "message": { "role": "user", "content": text },
            "session_id": session_id,
        });
        transport.send_message(&message).await
    }

    /// Convenience for a single text turn; `session_id` defaults to `"default"`.
    pub async fn query(&self, prompt: impl Into<String>) -> Result<()> {
        let transport = self.transport().await?;
        Self::send_user_message(&transport, prompt.into(), None).await
    }

    /// Same, with an explicit session id. An empty id is rewritten to `"default"`.
    pub async fn query_with_session(
        &self,
        prompt: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Result<()> {
        let transport = self.transport().await?;
        Self::send_user_message(&transport, prompt.into(), Some(session_id.into())).await
    }

    /// Drains an application-provided channel, forwarding each message and
    /// filling in `session_id = "default"` when absent. Returns the first
    /// transport send error.
    pub async fn query_stream(&self, mut messages: mpsc::Receiver<Value>) -> Result<()> {
        let transport = self.transport().await?;
        while let Some(mut value) = messages.recv().await {
            if let Value::Object(map) = &mut value {
                map.entry("session_id")
                    .or_insert_with(|| Value::String("default".to_string()));
            }
            transport.send_message(&value).await?;
        }
        Ok(())
    }

    /// Returns a stream over the entire conversation until stdout EOF. If
    /// not connected, the stream delivers a single `SystemMessage{subtype:
    /// "error"}` and closes.
    pub async fn receive_messages(&self) -> MessageStream<T> {
        MessageStream {
            transport: self.transport.read().await.clone(),
            emitted_disconnected_notice: false,
            stop_at_result: false,
            done: false,
        }
    }

    /// Returns a stream terminating at the first `ResultMessage`
    /// (inclusive) — the turn boundary.
    pub async fn receive_response(&self) -> MessageStream<T> {
        MessageStream {
            transport: self.transport.read().await.clone(),
            emitted_disconnected_notice: false,
            stop_at_result: true,
            done: false,
        }
    }

    pub async fn interrupt(&self) -> Result<()> {
        self.transport().await?.interrupt().await
    }

    pub async fn rewind_files(&self, user_message_id: impl Into<String>) -> Result<Value> {
        self.transport().await?.rewind_files(user_message_id.into()).await
    }

    pub async fn get_mcp_status(&self) -> Result<Value> {
        self.transport().await?.get_mcp_status().await
    }

    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<()> {
        self.transport().await?.set_permission_mode(mode).await
    }

    pub async fn set_model(&self, model: Option<String>) -> Result<()> {
        self.transport().await?.set_model(model).await
    }

    pub async fn get_server_info(&self) -> Result<Value> {
        self.transport().await?.get_server_info().await
    }
}

/// Iterator handed back by [`Client::receive_messages`] /
/// [`Client::receive_response`].
pub struct MessageStream<T: Transport = SubprocessTransport> {
    transport: Option<Arc<T>>,
    emitted_disconnected_notice: bool,
    stop_at_result: bool,
    done: bool,
}

impl<T: Transport> MessageStream<T> {
    pub async fn next(&mut self) -> Option<Result<Message>> {
        if self.done {
            return None;
        }

        let Some(transport) = self.transport.clone() else {
            self.done = true;
            if self.emitted_disconnected_notice {
                return None;
            }
            self.emitted_disconnected_notice = true;
            let mut payload = HashMap::new();
            payload.insert(
                "error".to_string(),
                Value::String("client is not connected".to_string()),
            );
            return Some(Ok(Message::System(SystemMessage {
                subtype: "error".to_string(),
                payload,
            })));
        };

        if let Some(err) = transport.next_error().await {
            return Some(Err(err));
        }

        match transport.next_message().await {
            Some(message) => {
                if self.stop_at_result && message.is_result() {
                    self.done = true;
                }
                Some(Ok(message))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// Constructs a client, connects, runs `f(client)`, and guarantees
/// `disconnect` on every exit path. `disconnect` errors are swallowed so
/// they never shadow `f`'s own error (§4.7).
pub async fn with_client<F, Fut, R>(options: ClaudeAgentOptions, f: F) -> Result<R>
where
    F: FnOnce(Arc<Client<SubprocessTransport>>) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let client = Arc::new(Client::new(options)?);
    client.connect(Vec::new()).await?;
    let result = f(Arc::clone(&client)).await;
    let _ = client.disconnect().await;
    result
}

/// Same as [`with_client`], but drives a caller-supplied [`Transport`]
/// instead of spawning a `SubprocessTransport` from options — the hook for
/// exercising [`Client`] against a fake transport without a real `claude`
/// binary on `PATH` (§4.7).
pub async fn with_client_transport<T, F, Fut, R>(transport: Arc<T>, f: F) -> Result<R>
where
    T: Transport,
    F: FnOnce(Arc<Client<T>>) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let client = Arc::new(Client::from_transport(transport));
    client.connect(Vec::new()).await?;
    let result = f(Arc::clone(&client)).await;
    let _ = client.disconnect().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receive_messages_without_connection_yields_single_system_error() {
        let client = Client::new(ClaudeAgentOptions::default()).unwrap();
        let mut stream = client.receive_messages().await;
        let first = stream.next().await.unwrap().unwrap();
        match first {
            Message::System(s) => assert_eq!(s.subtype, "error"),
            _ => panic!("expected SystemMessage"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn runtime_control_without_connection_fails_not_connected() {
        let client = Client::new(ClaudeAgentOptions::default()).unwrap();
        let err = client.interrupt().await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[test]
    fn can_use_tool_conflict_with_permission_prompt_tool_name_is_rejected() {
        struct AlwaysAllow;
        #[async_trait::async_trait]
        impl crate::options::CanUseTool for AlwaysAllow {
            async fn check(
                &self,
                _tool_name: String,
                _input: serde_json::Map<String, Value>,
                _context: crate::options::ToolPermissionContext,
            ) -> crate::options::PermissionResult {
                crate::options::PermissionResult::allow()
            }
        }
        let options = ClaudeAgentOptions {
            can_use_tool: Some(Arc::new(AlwaysAllow)),
            permission_prompt_tool_name: Some("custom".to_string()),
            ..Default::default()
        };
        assert!(Client::new(options).is_err());
    }
}
