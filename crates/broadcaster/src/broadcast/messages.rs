//! Message delivery to the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A message as delivered to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    /// Server receipt time, epoch milliseconds.
    pub received_at: i64,
    pub message: Value,
}

impl MessageEvent {
    pub fn new(received_at: i64, message: Value) -> Self {
        Self {
            received_at,
            message,
        }
    }

    /// The `messageId` field of the payload, if it has one.
    pub fn message_id(&self) -> Option<&str> {
        self.message.get("messageId").and_then(Value::as_str)
    }
}

/// Fans message batches out to every subscriber.
///
/// A live message is sent as a batch of one; a catch-up is sent as a single
/// batch in timestamp order.
#[derive(Clone)]
pub struct MessageBroadcaster {
    sender: Arc<broadcast::Sender<Vec<MessageEvent>>>,
}

impl MessageBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, messages: Vec<MessageEvent>) {
        if messages.is_empty() {
            return;
        }
        let _ = self.sender.send(messages);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<MessageEvent>> {
        self.sender.subscribe()
    }
}

impl Default for MessageBroadcaster {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_id() {
        let event = MessageEvent::new(1, json!({ "messageId": "abc", "post": {} }));
        assert_eq!(event.message_id(), Some("abc"));
        assert_eq!(MessageEvent::new(1, json!("plain")).message_id(), None);
        assert_eq!(MessageEvent::new(1, json!({ "messageId": 7 })).message_id(), None);
    }

    #[test]
    fn test_empty_batches_are_not_sent() {
        let broadcaster = MessageBroadcaster::new(4);
        let mut rx = broadcaster.subscribe();
        broadcaster.send(vec![]);
        broadcaster.send(vec![MessageEvent::new(5, json!({ "n": 1 }))]);
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(MessageEvent::new(42, json!({ "a": 1 }))).unwrap();
        assert_eq!(json, json!({ "receivedAt": 42, "message": { "a": 1 } }));
    }
}
