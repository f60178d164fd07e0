//! Wire-level message and content-block types.
//!
//! Shapes mirror the agent's stream-json protocol: every [`Message`] is
//! discriminated by its `type` tag, and every [`ContentBlock`] inside a
//! user/assistant message is discriminated the same way. Unknown content
//! block types decode to [`ContentBlock::Unknown`] rather than failing, so
//! the parser stays forward-compatible with agent versions newer than this
//! crate (§4.1).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One message in the conversation, as emitted on the agent's stdout.
///
/// Discriminated by the JSON `type` field. This is the type callers receive
/// from [`crate::query::MessageIterator::next`] and the streaming client's
/// receive methods.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    System(SystemMessage),
    Result(ResultMessage),
    StreamEvent(StreamEvent),
}

impl Message {
    /// `Some(&ResultMessage)` iff this is the terminal message of a turn.
    pub fn as_result(&self) -> Option<&ResultMessage> {
        match self {
            Message::Result(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Message::Result(_))
    }
}

/// `type = "user"`. Content is either a plain string or an ordered sequence
/// of content blocks — the agent uses the plain-string form for simple text
/// turns and the block form when replaying tool results.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserMessage {
    pub content: UserContent,
    /// Checkpoint handle; present once the agent has durably recorded the turn.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_use_result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// `type = "assistant"`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<AssistantError>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
}

/// Closed set of assistant-level error tags (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistantError {
    AuthenticationFailed,
    BillingError,
    RateLimit,
    InvalidRequest,
    ServerError,
    Unknown,
}

/// `type = "system"`. The payload is preserved verbatim for application use;
/// we only require `subtype` to be non-empty.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemMessage {
    pub subtype: String,
    #[serde(flatten)]
    pub payload: HashMap<String, serde_json::Value>,
}

/// `type = "result"`. Terminal marker of a turn (§3 invariant 5).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultMessage {
    pub subtype: String,
    pub duration_ms: i64,
    pub duration_api_ms: i64,
    pub is_error: bool,
    pub num_turns: i64,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub total_cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub usage: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub structured_output: Option<serde_json::Value>,
}

/// `type = "stream_event"`. Only emitted when the session opts into partial
/// messages (`include_partial_messages`); the inner event is opaque.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamEvent {
    pub uuid: String,
    pub session_id: String,
    pub event: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_tool_use_id: Option<String>,
}

/// A content block within a user or assistant message (§3). `Unknown`
/// preserves forward compatibility with block types this crate doesn't know
/// about yet.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        signature: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        content: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_content_block_type_is_skipped_forward_compatibly() {
        let raw = serde_json::json!({"type": "future_block", "foo": "bar"});
        let block: ContentBlock = serde_json::from_value(raw).unwrap();
        assert!(matches!(block, ContentBlock::Unknown));
    }

    #[test]
    fn tool_use_id_field_is_named_id_not_tool_use_id() {
        let raw = serde_json::json!({"type": "tool_use", "id": "abc", "name": "Bash", "input": {}});
        let block: ContentBlock = serde_json::from_value(raw).unwrap();
        match block {
            ContentBlock::ToolUse { id, name, .. } => {
                assert_eq!(id, "abc");
                assert_eq!(name, "Bash");
            }
            _ => panic!("expected ToolUse"),
        }
    }

    #[test]
    fn result_message_requires_integer_duration_fields() {
        let raw = serde_json::json!({
            "type": "result",
            "subtype": "success",
            "duration_ms": "not-a-number",
            "duration_api_ms": 9,
            "is_error": false,
            "num_turns": 1,
            "session_id": "s1",
        });
        let parsed: std::result::Result<Message, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn user_message_accepts_plain_string_content() {
        let raw = serde_json::json!({"type": "user", "content": "hello"});
        let msg: Message = serde_json::from_value(raw).unwrap();
        match msg {
            Message::User(UserMessage {
                content: UserContent::Text(s),
                ..
            }) => assert_eq!(s, "hello"),
            _ => panic!("expected UserMessage with text content"),
        }
    }

    #[test]
    fn system_message_preserves_payload_verbatim() {
        let raw = serde_json::json!({"type": "system", "subtype": "init", "model": "m", "cwd": "/tmp"});
        let msg: Message = serde_json::from_value(raw).unwrap();
        match msg {
            Message::System(s) => {
                assert_eq!(s.subtype, "init");
                assert_eq!(s.payload.get("model").unwrap(), "m");
            }
            _ => panic!("expected SystemMessage"),
        }
    }

    #[test]
    fn round_trip_result_message() {
        let msg = Message::Result(ResultMessage {
            subtype: "success".into(),
            duration_ms: 10,
            duration_api_ms: 9,
            is_error: false,
            num_turns: 1,
            session_id: "s1".into(),
            total_cost_usd: Some(0.01),
            usage: None,
            result: Some("4".into()),
            structured_output: None,
        });
        let encoded = serde_json::to_value(&msg).unwrap();
        let decoded: Message = serde_json::from_value(encoded).unwrap();
        assert!(matches!(decoded, Message::Result(_)));
    }
}
