//! Status events emitted to the caller.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// One of the statuses carried by a [`BroadcasterStatus`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BroadcasterStatusType {
    /// All requested channels are subscribed.
    Connected,
    /// Trouble with the network or one or more subscriptions; expected to be temporary.
    Trouble,
    /// Some channels could not be subscribed to and caller action is required.
    Failed,
    /// The network is down, messages are not being received.
    Offline,
    /// Too much missed history; the caller must re-bootstrap from a fresh snapshot.
    Reset,
    /// Terminal. The caller must build a new broadcaster, usually after re-authenticating.
    Aborted,

    // test mode only
    Confirmed,
    NetworkProblem,
    Queued,
}

impl std::fmt::Display for BroadcasterStatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BroadcasterStatusType::Connected => "Connected",
            BroadcasterStatusType::Trouble => "Trouble",
            BroadcasterStatusType::Failed => "Failed",
            BroadcasterStatusType::Offline => "Offline",
            BroadcasterStatusType::Reset => "Reset",
            BroadcasterStatusType::Aborted => "Aborted",
            BroadcasterStatusType::Confirmed => "Confirmed",
            BroadcasterStatusType::NetworkProblem => "NetworkProblem",
            BroadcasterStatusType::Queued => "Queued",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BroadcasterStatus {
    pub status: BroadcasterStatusType,
    /// Channels affected by this status, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<String>>,
    /// Set on `Connected` when it follows a `Trouble`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnected: Option<bool>,
}

impl BroadcasterStatus {
    pub fn new(status: BroadcasterStatusType) -> Self {
        Self {
            status,
            channels: None,
            reconnected: None,
        }
    }

    pub fn with_channels(status: BroadcasterStatusType, channels: Vec<String>) -> Self {
        Self {
            status,
            channels: Some(channels),
            reconnected: None,
        }
    }

    pub fn connected(channels: Vec<String>, reconnected: bool) -> Self {
        Self {
            status: BroadcasterStatusType::Connected,
            channels: Some(channels),
            reconnected: Some(reconnected),
        }
    }
}

/// Fans status events out to every subscriber.
#[derive(Clone)]
pub struct StatusBroadcaster {
    sender: Arc<broadcast::Sender<BroadcasterStatus>>,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, status: BroadcasterStatus) {
        // no active receivers is fine
        let _ = self.sender.send(status);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcasterStatus> {
        self.sender.subscribe()
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}
