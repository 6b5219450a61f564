//! The capability contract every push-messaging backend adapter implements.
//!
//! Adapters report asynchronously through a [`TransportEventSender`]: one
//! [`TransportEvent::Message`] per received message, and
//! [`TransportEvent::Status`] for subscription outcomes and network trouble.
//! A transport value only exists once its backend has been initialized, so
//! every operation below is callable as soon as the adapter is constructed.

pub mod pubnub;
pub mod retry;
pub mod socketcluster;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::HistoryError;
use crate::history::{HistoryOutput, HistoryRequest};

pub use pubnub::{PubnubConnection, PubnubSettings};
pub use retry::RetryPolicy;
pub use socketcluster::{SocketClusterConnection, SocketClusterSettings};

/// How long the default backends retain published messages.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub with_presence: bool,
}

/// Result of asking the backend whether we really are subscribed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmResult {
    /// The backend cannot tell; assume all is well.
    AllConfirmed,
    /// The backend cannot tell; assume every channel is in doubt.
    AllInDoubt,
    /// These channels are not actually subscribed.
    Specific(Vec<String>),
}

impl ConfirmResult {
    /// Normalizes to the list of troubled channels out of `channels`.
    pub fn trouble_channels(self, channels: &[String]) -> Vec<String> {
        match self {
            ConfirmResult::AllConfirmed => Vec::new(),
            ConfirmResult::AllInDoubt => channels.to_vec(),
            ConfirmResult::Specific(trouble) => trouble,
        }
    }
}

/// Subscription and connectivity reports from an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Connected(Vec<String>),
    Failed(Vec<String>),
    NetworkProblem,
    Offline,
    /// The backend answered in a way that leaves the session unrecoverable.
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    /// Server receipt time, epoch milliseconds.
    pub received_at: i64,
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(TransportMessage),
    Status(TransportStatus),
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub fn event_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::unbounded_channel()
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Requests membership in `channels`. Channels already confirmed
    /// subscribed are reported `Connected` right away without a new request.
    fn subscribe(&self, channels: &[String], options: &SubscribeOptions);

    /// Leaves `channels`. Idempotent.
    fn unsubscribe(&self, channels: &[String]);

    /// Re-establishes the underlying connection, keeping subscription state.
    fn reconnect(&self);

    /// Asks the backend which of `channels` we are not really subscribed to.
    async fn confirm_subscriptions(&self, channels: &[String]) -> ConfirmResult;

    async fn fetch_history(&self, request: HistoryRequest) -> Result<HistoryOutput, HistoryError>;

    /// Releases every resource held by the adapter.
    fn disconnect(&self);

    /// How far back `fetch_history` can reach.
    fn retention(&self) -> Duration {
        DEFAULT_RETENTION
    }
}

pub(crate) fn send_status(events: &TransportEventSender, status: TransportStatus) {
    if events.send(TransportEvent::Status(status)).is_err() {
        log::debug!("Transport event receiver dropped, status not delivered");
    }
}

pub(crate) fn send_message(events: &TransportEventSender, received_at: i64, message: Value) {
    let _ = events.send(TransportEvent::Message(TransportMessage {
        received_at,
        message,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> Vec<String> {
        vec!["team-1".to_string(), "user-2".to_string()]
    }

    #[test]
    fn test_confirm_result_normalization() {
        assert!(ConfirmResult::AllConfirmed.trouble_channels(&channels()).is_empty());
        assert_eq!(ConfirmResult::AllInDoubt.trouble_channels(&channels()), channels());
        assert_eq!(
            ConfirmResult::Specific(vec!["user-2".to_string()]).trouble_channels(&channels()),
            vec!["user-2".to_string()]
        );
    }

    #[test]
    fn test_event_channel_delivery() {
        let (tx, mut rx) = event_channel();
        send_status(&tx, TransportStatus::Connected(channels()));
        send_message(&tx, 10, serde_json::json!({ "x": 1 }));
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Status(TransportStatus::Connected(channels()))
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            TransportEvent::Message(TransportMessage { received_at: 10, .. })
        ));
    }
}
