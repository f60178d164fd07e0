//! Speculative, buffer-and-retry JSON line parser (§4.1).
//!
//! Agents may split one JSON object across several physical lines, or place
//! several objects on one line separated by newlines; the parser copes with
//! both by maintaining an append-only buffer and attempting a decode after
//! every line, rather than assuming one line is one object.

use std::sync::Mutex;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::options::DEFAULT_MAX_BUFFER_SIZE;
use crate::types::Message;

/// Closed set of `type` tags this crate knows how to decode into a
/// [`Message`]. Anything else is skipped forward-compatibly (§4.1).
const KNOWN_MESSAGE_TYPES: &[&str] = &["user", "assistant", "system", "result", "stream_event"];

/// Buffered line-oriented parser. `process_line` resets its working state at
/// each call so a caller can reuse one instance across the life of a
/// transport without leaking partial state from a prior connection.
pub struct Parser {
    buffer: Mutex<String>,
    max_buffer_size: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_SIZE)
    }
}

impl Parser {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            buffer: Mutex::new(String::new()),
            max_buffer_size: if max_buffer_size == 0 {
                DEFAULT_MAX_BUFFER_SIZE
            } else {
                max_buffer_size
            },
        }
    }

    /// Feeds one line of stdout into the buffer and attempts a decode.
    ///
    /// Returns zero or more messages: zero when the buffer doesn't yet hold
    /// a complete JSON value or the value's `type` is unrecognized, one
    /// otherwise. Never returns a partially-formed message (§3 invariant 4).
    pub fn process_line(&self, line: &str) -> Result<Vec<Message>> {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut buffer = self.buffer.lock().expect("parser buffer mutex poisoned");
        if !buffer.is_empty() {
            buffer.push('\n');
        }
        buffer.push_str(line);

        match serde_json::from_str::<Value>(&buffer) {
            Ok(value) => {
                buffer.clear();
                drop(buffer);
                match Self::decode(value)? {
                    Some(message) => Ok(vec![message]),
                    None => Ok(Vec::new()),
                }
            }
            Err(_) if buffer.len() > self.max_buffer_size => {
                let limit = self.max_buffer_size;
                buffer.clear();
                Err(Error::JsonDecode { limit })
            }
            Err(_) => Ok(Vec::new()),
        }
    }

    fn decode(value: Value) -> Result<Option<Message>> {
        let type_tag = value.get("type").and_then(Value::as_str);
        match type_tag {
            Some(tag) if KNOWN_MESSAGE_TYPES.contains(&tag) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| Error::MessageParse(e.to_string())),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_only_line_yields_nothing() {
        let parser = Parser::default();
        assert!(parser.process_line("   ").unwrap().is_empty());
    }

    #[test]
    fn complete_object_on_one_line_decodes_immediately() {
        let parser = Parser::default();
        let line = r#"{"type":"system","subtype":"init"}"#;
        let messages = parser.process_line(line).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], Message::System(_)));
    }

    #[test]
    fn object_split_across_lines_decodes_once_complete() {
        let parser = Parser::default();
        assert!(parser.process_line(r#"{"type":"system","#).unwrap().is_empty());
        assert!(parser.process_line(r#""subtype":"init""#).unwrap().is_empty());
        let messages = parser.process_line("}").unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn unknown_type_is_skipped_not_errored() {
        let parser = Parser::default();
        let line = r#"{"type":"from_the_future","foo":"bar"}"#;
        assert!(parser.process_line(line).unwrap().is_empty());
    }

    #[test]
    fn buffer_overflow_raises_json_decode_error_and_clears() {
        let parser = Parser::new(16);
        let err = parser.process_line(&"x".repeat(32)).unwrap_err();
        assert!(matches!(err, Error::JsonDecode { limit: 16 }));
        // buffer was cleared; a fresh complete object decodes cleanly.
        let messages = parser
            .process_line(r#"{"type":"system","subtype":"init"}"#)
            .unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn strict_numeric_fields_reject_non_numeric_duration() {
        let parser = Parser::default();
        let line = r#"{"type":"result","subtype":"success","duration_ms":"oops","duration_api_ms":1,"is_error":false,"num_turns":1,"session_id":"s"}"#;
        let err = parser.process_line(line).unwrap_err();
        assert!(matches!(err, Error::MessageParse(_)));
    }
}
