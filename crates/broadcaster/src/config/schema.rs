use serde::{Deserialize, Serialize};

use crate::secrets::SecretSource;

/// Initialization input for a [`Broadcaster`](crate::Broadcaster).
///
/// Exactly one of `subscribe_key` (PubNub) or `socket_cluster` selects the
/// transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcasterConfig {
    /// Access token for API requests made by the surrounding client.
    pub access_token: SecretSource,
    /// Broadcaster token issued with the login response.
    pub auth_key: SecretSource,
    /// ID of the current user.
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_cluster: Option<SocketClusterEndpoint>,
    /// Reject self-signed certificates.
    #[serde(default = "default_true")]
    pub strict_ssl: bool,
    /// Persisted checkpoint from a previous session, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_received_at: Option<i64>,
    /// Emit the test-only `Queued`, `NetworkProblem` and `Confirmed` statuses.
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default = "default_pubnub_origin")]
    pub pubnub_origin: String,
    #[serde(default = "default_status_capacity")]
    pub status_capacity: usize,
    #[serde(default = "default_message_capacity")]
    pub message_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SocketClusterEndpoint {
    pub host: String,
    pub port: u16,
    /// Connect over plain `ws://` instead of `wss://`.
    #[serde(default)]
    pub ignore_https: bool,
}

impl SocketClusterEndpoint {
    pub fn url(&self) -> String {
        let scheme = if self.ignore_https { "ws" } else { "wss" };
        format!("{}://{}:{}/socketcluster/", scheme, self.host, self.port)
    }
}

/// The backend selected by a validated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Pubnub { subscribe_key: String },
    SocketCluster(SocketClusterEndpoint),
}

impl BroadcasterConfig {
    /// Returns the selected backend, or `None` if the config names zero or two backends.
    pub fn backend(&self) -> Option<Backend> {
        match (&self.subscribe_key, &self.socket_cluster) {
            (Some(key), None) => Some(Backend::Pubnub {
                subscribe_key: key.clone(),
            }),
            (None, Some(endpoint)) => Some(Backend::SocketCluster(endpoint.clone())),
            _ => None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_pubnub_origin() -> String {
    "ps.pndsn.com".to_string()
}

fn default_status_capacity() -> usize {
    100
}

fn default_message_capacity() -> usize {
    4096
}
