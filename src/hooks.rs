//! Hook processor (C2): owns the registered hook callbacks and the single
//! optional tool-permission callback, and translates between their Rust
//! return types and the agent's wire shapes (§4.2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::options::{
    CanUseTool, HookCallback, HookContext, HookEvent, HookInput, HookMatcher, PermissionResult,
    ToolPermissionContext,
};

/// Registers callbacks at construction and answers the two C3 dispatch
/// entry points, `hook_callback` and `can_use_tool`.
pub struct HookProcessor {
    callbacks: RwLock<HashMap<String, Arc<dyn HookCallback>>>,
    can_use_tool: Option<Arc<dyn CanUseTool>>,
    next_id: AtomicU64,
}

impl HookProcessor {
    pub fn new(can_use_tool: Option<Arc<dyn CanUseTool>>) -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
            can_use_tool,
            next_id: AtomicU64::new(0),
        }
    }

    fn mint_callback_id(&self) -> String {
        format!("hook_{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Registers every (event, matcher, callback) triple and assembles the
    /// `hooks` field of the `initialize` control request: per event, a list
    /// of `{ matcher, hookCallbackIds, timeout? }` descriptors.
    pub async fn build_hooks_config(
        &self,
        hooks: &HashMap<HookEvent, Vec<HookMatcher>>,
    ) -> Option<Value> {
        if hooks.is_empty() {
            return None;
        }

        let mut config = Map::new();
        for (event, matchers) in hooks {
            let mut descriptors = Vec::new();
            for matcher in matchers {
                let mut callback_ids = Vec::new();
                for callback in &matcher.callbacks {
                    let id = self.mint_callback_id();
                    self.callbacks.write().await.insert(id.clone(), Arc::clone(callback));
                    callback_ids.push(id);
                }
                if callback_ids.is_empty() {
                    continue;
                }
                let mut descriptor = Map::new();
                if let Some(m) = &matcher.matcher {
                    descriptor.insert("matcher".to_string(), Value::String(m.clone()));
                }
                descriptor.insert("hookCallbackIds".to_string(), Value::Array(
                    callback_ids.into_iter().map(Value::String).collect(),
                ));
                if let Some(timeout) = matcher.timeout {
                    descriptor.insert("timeout".to_string(), Value::from(timeout.as_secs()));
                }
                descriptors.push(Value::Object(descriptor));
            }
            if !descriptors.is_empty() {
                let event_name = serde_json::to_value(event)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                config.insert(event_name, Value::Array(descriptors));
            }
        }

        if config.is_empty() {
            None
        } else {
            Some(Value::Object(config))
        }
    }

    /// Dispatches an inbound `control_request { subtype: "hook_callback" }`.
    pub async fn dispatch_hook_callback(
        &self,
        callback_id: &str,
        event: HookEvent,
        raw_input: Map<String, Value>,
        tool_use_id: Option<String>,
        context: HookContext,
    ) -> Result<Value> {
        let callback = {
            let callbacks = self.callbacks.read().await;
            callbacks.get(callback_id).cloned()
        };
        let Some(callback) = callback else {
            return Err(Error::ControlProtocol(format!(
                "no hook callback found for ID: {callback_id}"
            )));
        };

        let input = HookInput {
            event,
            payload: raw_input,
            tool_use_id,
        };
        let mut output = callback.call(input, context).await;

        // The callback's output uses Rust-safe field names; translate them
        // back onto the CLI's reserved-word field names before emitting.
        if let Some(v) = output.remove("async_") {
            output.insert("async".to_string(), v);
        }
        if let Some(v) = output.remove("continue_") {
            output.insert("continue".to_string(), v);
        }

        Ok(Value::Object(output))
    }

    /// Dispatches an inbound `control_request { subtype: "can_use_tool" }`.
    pub async fn dispatch_can_use_tool(
        &self,
        tool_name: String,
        input: Map<String, Value>,
        suggestions: Vec<Value>,
    ) -> Result<Value> {
        let Some(callback) = &self.can_use_tool else {
            return Err(Error::ControlProtocol(
                "canUseTool callback is not provided".to_string(),
            ));
        };

        let context = ToolPermissionContext { suggestions };
        let result = callback.check(tool_name, input.clone(), context).await;

        let response = match result {
            PermissionResult::Allow {
                updated_input,
                updated_permissions,
            } => {
                let mut map = Map::new();
                map.insert("behavior".to_string(), Value::String("allow".to_string()));
                map.insert(
                    "updatedInput".to_string(),
                    Value::Object(updated_input.unwrap_or(input)),
                );
                if let Some(updates) = updated_permissions {
                    map.insert("updatedPermissions".to_string(), Value::Array(updates));
                }
                map
            }
            PermissionResult::Deny { message, interrupt } => {
                let mut map = Map::new();
                map.insert("behavior".to_string(), Value::String("deny".to_string()));
                map.insert("message".to_string(), Value::String(message));
                map.insert("interrupt".to_string(), Value::Bool(interrupt));
                map
            }
        };

        Ok(Value::Object(response))
    }
}
