//! Bidirectional control protocol (C3): request/response layer sharing the
//! agent's stdin/stdout, initialized once per streaming session (§4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::hooks::HookProcessor;
use crate::mcp_bridge::{McpBridge, NoMcpBridge};
use crate::options::{HookEvent, HookMatcher};

/// Emits one line of bytes to the child's stdin, atomically with respect to
/// other writers. Implemented by C4's transport.
#[async_trait]
pub trait LineWriter: Send + Sync {
    async fn write_line(&self, line: String) -> Result<()>;
}

struct PendingOutbound {
    sender: oneshot::Sender<std::result::Result<Value, String>>,
}

/// Owns the pending-request table and dispatches inbound control frames.
/// Constructed once per connected transport and torn down on `close`.
pub struct ControlProtocol {
    writer: Arc<dyn LineWriter>,
    hooks: Arc<HookProcessor>,
    mcp_bridge: Arc<dyn McpBridge>,
    pending_outbound: RwLock<HashMap<String, PendingOutbound>>,
    pending_inbound: RwLock<HashMap<String, CancellationToken>>,
    request_counter: AtomicU64,
    cancel: CancellationToken,
}

impl ControlProtocol {
    pub fn new(writer: Arc<dyn LineWriter>, hooks: Arc<HookProcessor>) -> Self {
        Self::with_mcp_bridge(writer, hooks, Arc::new(NoMcpBridge))
    }

    pub fn with_mcp_bridge(
        writer: Arc<dyn LineWriter>,
        hooks: Arc<HookProcessor>,
        mcp_bridge: Arc<dyn McpBridge>,
    ) -> Self {
        Self {
            writer,
            hooks,
            mcp_bridge,
            pending_outbound: RwLock::new(HashMap::new()),
            pending_inbound: RwLock::new(HashMap::new()),
            request_counter: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    fn next_request_id(&self) -> String {
        format!("req_{}", self.request_counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Sends `control_request { subtype: "initialize", hooks: {...} }` and
    /// awaits the matching response. Timeout is `max(60s, stream_close_timeout)`
    /// per §4.3; the caller computes that ceiling from
    /// `CLAUDE_CODE_STREAM_CLOSE_TIMEOUT`.
    pub async fn initialize(
        &self,
        hooks: &HashMap<HookEvent, Vec<HookMatcher>>,
        timeout: Duration,
    ) -> Result<Value> {
        let hooks_config = self.hooks.build_hooks_config(hooks).await;
        let mut payload = Map::new();
        payload.insert("subtype".to_string(), Value::String("initialize".to_string()));
        if let Some(config) = hooks_config {
            payload.insert("hooks".to_string(), config);
        }
        self.send_control_request(Value::Object(payload), timeout.max(Duration::from_secs(60)))
            .await
    }

    /// Sends an arbitrary outbound `control_request` and awaits its response.
    pub async fn send_control_request(&self, request: Value, timeout: Duration) -> Result<Value> {
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending_outbound
            .write()
            .await
            .insert(request_id.clone(), PendingOutbound { sender: tx });

        let envelope = serde_json::json!({
            "type": "control_request",
            "request_id": request_id,
            "request": request,
        });

        if let Err(e) = self.writer.write_line(envelope.to_string()).await {
            self.pending_outbound.write().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(Error::ControlProtocol(message)),
            Ok(Err(_)) => Err(Error::ControlProtocol(
                "control request sender dropped".to_string(),
            )),
            Err(_) => {
                self.pending_outbound.write().await.remove(&request_id);
                Err(Error::ControlTimeout { request_id, timeout })
            }
        }
    }

    /// Convenience wrapper for the §4.4.7 runtime control methods: wraps
    /// `subtype` plus an arbitrary payload map into one request object.
    pub async fn send_subtype_request(
        &self,
        subtype: &str,
        mut fields: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value> {
        fields.insert("subtype".to_string(), Value::String(subtype.to_string()));
        self.send_control_request(Value::Object(fields), timeout).await
    }

    /// Routes one decoded control-envelope line from the stdout pump (§4.4.3).
    /// Takes an explicit `Arc` handle (rather than an `Arc`-typed receiver)
    /// so a `control_request` can be dispatched on a fresh task without
    /// blocking the pump that calls this.
    pub async fn handle_inbound_line(protocol: &Arc<Self>, value: Value) {
        match value.get("type").and_then(Value::as_str) {
            Some("control_response") => protocol.handle_control_response(value).await,
            Some("control_request") => {
                let this = Arc::clone(protocol);
                tokio::spawn(async move { this.handle_control_request(value).await });
            }
            Some("control_cancel_request") => protocol.handle_cancel_request(value).await,
            other => warn!(?other, "unrecognized control envelope type"),
        }
    }

    async fn handle_control_response(&self, value: Value) {
        let response = value.get("response").cloned().unwrap_or(Value::Null);
        let Some(request_id) = response.get("request_id").and_then(Value::as_str) else {
            warn!("control_response missing request_id");
            return;
        };

        let pending = self.pending_outbound.write().await.remove(request_id);
        let Some(pending) = pending else {
            debug!(request_id, "dropping control_response for unknown request");
            return;
        };

        let subtype = response.get("subtype").and_then(Value::as_str).unwrap_or("");
        let outcome = if subtype == "error" {
            let message = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("control request failed")
                .to_string();
            Err(message)
        } else {
            Ok(response.get("response").cloned().unwrap_or(Value::Null))
        };
        let _ = pending.sender.send(outcome);
    }

    async fn handle_control_request(&self, value: Value) {
        let request_id = value
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let request = value.get("request").cloned().unwrap_or(Value::Null);

        let token = CancellationToken::new();
        self.pending_inbound
            .write()
            .await
            .insert(request_id.clone(), token.clone());

        let result = self.process_control_request(request, token).await;
        self.pending_inbound.write().await.remove(&request_id);

        let envelope = match result {
            Ok(data) => serde_json::json!({
                "type": "control_response",
                "response": { "subtype": "success", "request_id": request_id, "response": data },
            }),
            Err(e) => serde_json::json!({
                "type": "control_response",
                "response": { "subtype": "error", "request_id": request_id, "error": e.to_string() },
            }),
        };

        if let Err(e) = self.writer.write_line(envelope.to_string()).await {
            warn!(error = %e, "failed to send control_response");
        }
    }

    async fn handle_cancel_request(&self, value: Value) {
        let Some(request_id) = value.get("request_id").and_then(Value::as_str) else {
            return;
        };
        // Silently dropped if the request already completed or the id is
        // unknown — see DESIGN.md Open Question 1.
        if let Some(token) = self.pending_inbound.read().await.get(request_id) {
            token.cancel();
        }
    }

    async fn process_control_request(&self, request: Value, token: CancellationToken) -> Result<Value> {
        let subtype = request.get("subtype").and_then(Value::as_str).unwrap_or("");
        trace!(subtype, "dispatching inbound control request");

        match subtype {
            "can_use_tool" => {
                let tool_name = request
                    .get("tool_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let input = request
                    .get("input")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let suggestions = request
                    .get("permission_suggestions")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                self.hooks.dispatch_can_use_tool(tool_name, input, suggestions).await
            }
            "hook_callback" => {
                let callback_id = request
                    .get("callback_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let event = request
                    .get("hook_event_name")
                    .and_then(Value::as_str)
                    .and_then(|s| serde_json::from_value(Value::String(s.to_string())).ok())
                    .unwrap_or(HookEvent::Notification);
                let input = request
                    .get("input")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let tool_use_id = request
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let context = crate::options::HookContext { cancel: Some(token) };
                self.hooks
                    .dispatch_hook_callback(&callback_id, event, input, tool_use_id, context)
                    .await
            }
            "mcp_message" => {
                let server_name = request
                    .get("server_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let message = request.get("message").cloned().unwrap_or(Value::Null);
                self.mcp_bridge.handle_message(server_name, message).await
            }
            other => Err(Error::ControlProtocol(format!("unknown subtype: {other}"))),
        }
    }

    /// Fails every outstanding outbound waiter. C4 calls this when its
    /// stdout scanner returns unexpectedly so pending callers don't block on
    /// a dead process (§4.3, tested by S5).
    pub async fn fail_pending_requests(&self, error: &Error) {
        let mut pending = self.pending_outbound.write().await;
        for (_, p) in pending.drain() {
            let _ = p.sender.send(Err(error.to_string()));
        }
    }

    /// Cancels all waiters and clears the pending table.
    pub async fn close(&self) {
        self.cancel.cancel();
        for (_, token) in self.pending_inbound.write().await.drain() {
            token.cancel();
        }
        let mut pending = self.pending_outbound.write().await;
        for (_, p) in pending.drain() {
            let _ = p.sender.send(Err("control protocol closed".to_string()));
        }
    }
}
