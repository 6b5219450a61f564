//! Reassembly of messages split into parts by the publisher.
//!
//! A part is a JSON object `{fullMessageId, part, totalParts, message}` where
//! `message` is a string slice of the serialized full message. Parts may arrive
//! in any order; the full message is emitted once every part is present.

use std::collections::HashMap;

use serde_json::Value;

/// Upper bound on `totalParts` accepted from the wire.
pub const MAX_PARTS: usize = 1024;

#[derive(Debug, Default)]
pub struct PartialMessageBuffer {
    pending: HashMap<String, Vec<Option<String>>>,
}

impl PartialMessageBuffer {
    /// Returns the message to deliver, if any.
    ///
    /// Non-partial messages pass straight through. A part yields `None` until its
    /// message is complete; a complete message that fails to parse is dropped.
    pub fn accept(&mut self, message: Value) -> Option<Value> {
        let Some(full_message_id) = message.get("fullMessageId").and_then(Value::as_str) else {
            return Some(message);
        };
        let full_message_id = full_message_id.to_string();

        let part = message.get("part").and_then(Value::as_u64);
        let total = message.get("totalParts").and_then(Value::as_u64);
        let text = message.get("message").and_then(Value::as_str);
        let (Some(part), Some(total), Some(text)) = (part, total, text) else {
            tracing::warn!(%full_message_id, "Malformed message part, dropping");
            return None;
        };
        let total = match usize::try_from(total) {
            Ok(total) if (1..=MAX_PARTS).contains(&total) => total,
            _ => {
                tracing::warn!(%full_message_id, total, "Unsupported part count, dropping");
                return None;
            }
        };
        let part = usize::try_from(part).unwrap_or(usize::MAX);
        if part >= total {
            tracing::warn!(%full_message_id, part, total, "Message part out of range, dropping");
            return None;
        }

        let parts = self
            .pending
            .entry(full_message_id.clone())
            .or_insert_with(|| vec![None; total]);
        if part >= parts.len() {
            tracing::warn!(%full_message_id, part, total, "Message part out of range, dropping");
            return None;
        }
        parts[part] = Some(text.to_string());

        if parts.iter().any(Option::is_none) {
            return None;
        }

        let joined: String = self
            .pending
            .remove(&full_message_id)
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .collect();
        match serde_json::from_str(&joined) {
            Ok(full) => Some(full),
            Err(e) => {
                tracing::warn!(%full_message_id, "Unable to parse reassembled message, dropping: {}", e);
                None
            }
        }
    }

    /// Number of messages still waiting for parts.
    pub fn incomplete(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parts(full: &Value, count: usize) -> Vec<Value> {
        let text = full.to_string();
        let size = text.len().div_ceil(count);
        text.as_bytes()
            .chunks(size)
            .enumerate()
            .map(|(i, chunk)| {
                json!({
                    "fullMessageId": "full-1",
                    "part": i,
                    "totalParts": count,
                    "message": std::str::from_utf8(chunk).unwrap(),
                })
            })
            .collect()
    }

    #[test]
    fn test_plain_message_passes_through() {
        let mut buffer = PartialMessageBuffer::default();
        let message = json!({ "messageId": "m1", "posts": [] });
        assert_eq!(buffer.accept(message.clone()), Some(message));
        assert_eq!(buffer.accept(json!("text")), Some(json!("text")));
    }

    #[test]
    fn test_out_of_order_parts_reassemble() {
        let full = json!({ "messageId": "m1", "posts": [{ "text": "a long post body" }] });
        let mut pieces = parts(&full, 3);
        pieces.reverse();

        let mut buffer = PartialMessageBuffer::default();
        assert_eq!(buffer.accept(pieces[0].clone()), None);
        assert_eq!(buffer.accept(pieces[1].clone()), None);
        assert_eq!(buffer.accept(pieces[2].clone()), Some(full));
        assert_eq!(buffer.incomplete(), 0);
    }

    #[test]
    fn test_missing_part_delivers_nothing() {
        let full = json!({ "messageId": "m1", "body": "xxxxxxxxxxxxxxxx" });
        let pieces = parts(&full, 3);

        let mut buffer = PartialMessageBuffer::default();
        assert_eq!(buffer.accept(pieces[0].clone()), None);
        assert_eq!(buffer.accept(pieces[2].clone()), None);
        assert_eq!(buffer.incomplete(), 1);
    }

    #[test]
    fn test_unparsable_message_is_dropped() {
        let mut buffer = PartialMessageBuffer::default();
        let first = json!({ "fullMessageId": "bad", "part": 0, "totalParts": 2, "message": "{\"a\":" });
        let second = json!({ "fullMessageId": "bad", "part": 1, "totalParts": 2, "message": "oops" });
        assert_eq!(buffer.accept(first), None);
        assert_eq!(buffer.accept(second), None);
        assert_eq!(buffer.incomplete(), 0);
    }

    #[test]
    fn test_unbounded_part_count_is_dropped() {
        let mut buffer = PartialMessageBuffer::default();
        let huge = json!({ "fullMessageId": "x", "part": 0, "totalParts": u64::MAX, "message": "a" });
        assert_eq!(buffer.accept(huge), None);
        let zero = json!({ "fullMessageId": "y", "part": 0, "totalParts": 0, "message": "a" });
        assert_eq!(buffer.accept(zero), None);
        let over = json!({ "fullMessageId": "z", "part": 0, "totalParts": MAX_PARTS + 1, "message": "a" });
        assert_eq!(buffer.accept(over), None);
        assert_eq!(buffer.incomplete(), 0);
    }

    #[test]
    fn test_out_of_range_part_is_dropped() {
        let mut buffer = PartialMessageBuffer::default();
        let part = json!({ "fullMessageId": "f", "part": 4, "totalParts": 2, "message": "x" });
        assert_eq!(buffer.accept(part), None);
        assert_eq!(buffer.incomplete(), 0);
    }
}
