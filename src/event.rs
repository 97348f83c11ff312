//! Events carried on the chat push channel.
//!
//! Each event travels as one `data: ` line holding a JSON object, followed by
//! a blank line:
//!
//! ```text
//! data: {"type":"content","content":"Hi"}
//!
//! data: {"type":"done","message_id":42}
//!
//! ```

use serde::{Deserialize, Serialize};

pub const DATA_PREFIX: &str = "data: ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayEvent {
    /// One fragment of generated text, in upstream order.
    Content { content: String },
    /// Normal completion. `message_id` is null when nothing was persisted.
    Done { message_id: Option<i64> },
    /// Generation failed; `content` is meant for display.
    Error { content: String },
}

impl RelayEvent {
    pub fn content(fragment: impl Into<String>) -> Self {
        RelayEvent::Content {
            content: fragment.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        RelayEvent::Error {
            content: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RelayEvent::Content { .. })
    }

    /// Parses one complete line of the push channel. Lines without the data
    /// prefix (keep-alive comments, blank separators) and malformed payloads
    /// yield `None`.
    pub fn from_line(line: &str) -> Option<Self> {
        let payload = line.strip_prefix(DATA_PREFIX)?;
        serde_json::from_str(payload).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shapes() {
        assert_eq!(
            serde_json::to_string(&RelayEvent::content("Hi")).unwrap(),
            r#"{"type":"content","content":"Hi"}"#
        );
        assert_eq!(
            serde_json::to_string(&RelayEvent::Done { message_id: None }).unwrap(),
            r#"{"type":"done","message_id":null}"#
        );
        assert_eq!(
            serde_json::to_string(&RelayEvent::Done { message_id: Some(7) }).unwrap(),
            r#"{"type":"done","message_id":7}"#
        );
        assert_eq!(
            serde_json::to_string(&RelayEvent::error("boom")).unwrap(),
            r#"{"type":"error","content":"boom"}"#
        );
    }

    #[test]
    fn test_from_line_accepts_data_lines_only() {
        assert_eq!(
            RelayEvent::from_line(r#"data: {"type":"content","content":"x"}"#),
            Some(RelayEvent::content("x"))
        );
        assert_eq!(RelayEvent::from_line(""), None);
        assert_eq!(RelayEvent::from_line(": keep-alive"), None);
        assert_eq!(RelayEvent::from_line(r#"event: {"type":"done"}"#), None);
    }

    #[test]
    fn test_from_line_skips_malformed_payloads() {
        assert_eq!(RelayEvent::from_line("data: {not json"), None);
        assert_eq!(RelayEvent::from_line(r#"data: {"type":"ping"}"#), None);
        assert_eq!(RelayEvent::from_line(r#"data: {"type":"content"}"#), None);
    }

    #[test]
    fn test_done_without_message_id_field() {
        assert_eq!(
            RelayEvent::from_line(r#"data: {"type":"done"}"#),
            Some(RelayEvent::Done { message_id: None })
        );
    }
}
