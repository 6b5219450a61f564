//! The caller-facing broadcaster.
//!
//! [`Broadcaster`] is a cheap handle onto the orchestrator task in [`engine`].
//! Every operation is a message to that task; results come back through the
//! status and message streams.

pub mod catchup;
pub mod dedup;
mod engine;
pub mod partial;
pub mod subscriptions;
pub mod throttle;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::broadcast::{BroadcasterStatus, MessageBroadcaster, MessageEvent, StatusBroadcaster};
use crate::clock::{Clock, SystemClock};
use crate::config::{validate_config, Backend, BroadcasterConfig};
use crate::error::{ConfigError, Result};
use crate::transport::{
    event_channel, PubnubConnection, PubnubSettings, SocketClusterConnection, SocketClusterSettings,
    Transport, TransportEventReceiver,
};

use engine::{Command, EngineOptions, Outputs};

pub use engine::{LONG_TICK_MS, LONG_TICK_PAUSE, STATUS_TIMEOUT, TICK_INTERVAL};

/// Engine settings that don't depend on the backend.
#[derive(Debug, Clone)]
pub struct BroadcasterOptions {
    pub test_mode: bool,
    /// Checkpoint persisted by a previous session, epoch milliseconds.
    pub last_message_received_at: Option<i64>,
    pub status_capacity: usize,
    pub message_capacity: usize,
}

impl Default for BroadcasterOptions {
    fn default() -> Self {
        Self {
            test_mode: false,
            last_message_received_at: None,
            status_capacity: 100,
            message_capacity: 4096,
        }
    }
}

impl BroadcasterOptions {
    pub fn from_config(config: &BroadcasterConfig) -> Self {
        Self {
            test_mode: config.test_mode,
            last_message_received_at: config.last_message_received_at,
            status_capacity: config.status_capacity,
            message_capacity: config.message_capacity,
        }
    }
}

pub struct Broadcaster {
    commands: mpsc::UnboundedSender<Command>,
    statuses: StatusBroadcaster,
    messages: MessageBroadcaster,
}

impl Broadcaster {
    /// Connects the backend named by `config` and starts the orchestrator.
    pub async fn initialize(config: &BroadcasterConfig) -> Result<Self> {
        validate_config(config)?;
        let auth_key = config.auth_key.resolve().map_err(|source| ConfigError::Secret {
            name: "authKey".to_string(),
            source,
        })?;
        let backend = config.backend().ok_or_else(|| ConfigError::Validation {
            message: "one of subscribeKey or socketCluster is required".to_string(),
        })?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (events, event_rx) = event_channel();

        let transport: Arc<dyn Transport> = match backend {
            Backend::Pubnub { subscribe_key } => {
                tracing::info!(user_id = %config.user_id, "Initializing PubNub broadcaster");
                let settings = PubnubSettings {
                    origin: config.pubnub_origin.clone(),
                    subscribe_key,
                    auth_key,
                    user_id: config.user_id.clone(),
                    strict_ssl: config.strict_ssl,
                    proxy_url: config.proxy_url.clone(),
                };
                Arc::new(PubnubConnection::connect(settings, Arc::clone(&clock), events)?)
            }
            Backend::SocketCluster(endpoint) => {
                tracing::info!(user_id = %config.user_id, url = %endpoint.url(), "Initializing SocketCluster broadcaster");
                let settings = SocketClusterSettings {
                    url: endpoint.url(),
                    auth_key,
                    user_id: config.user_id.clone(),
                    strict_ssl: config.strict_ssl,
                };
                Arc::new(SocketClusterConnection::connect(settings, Arc::clone(&clock), events).await?)
            }
        };

        Ok(Self::start_with_clock(
            transport,
            event_rx,
            BroadcasterOptions::from_config(config),
            clock,
        ))
    }

    /// Starts the orchestrator over an already connected transport.
    ///
    /// `events` must be the receiving half of the channel the transport reports on.
    pub fn start(
        transport: Arc<dyn Transport>,
        events: TransportEventReceiver,
        options: BroadcasterOptions,
    ) -> Self {
        Self::start_with_clock(transport, events, options, Arc::new(SystemClock))
    }

    pub fn start_with_clock(
        transport: Arc<dyn Transport>,
        events: TransportEventReceiver,
        options: BroadcasterOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let statuses = StatusBroadcaster::new(options.status_capacity.max(1));
        let messages = MessageBroadcaster::new(options.message_capacity.max(1));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let engine_options = EngineOptions {
            test_mode: options.test_mode,
            last_message_received_at: options.last_message_received_at.unwrap_or(0),
            initialization_started_at: clock.now_ms(),
        };
        let outputs = Outputs {
            statuses: statuses.clone(),
            messages: messages.clone(),
        };
        engine::spawn(transport, clock, outputs, engine_options, command_rx, events);

        Self {
            commands,
            statuses,
            messages,
        }
    }

    /// Status events from now on.
    pub fn status_events(&self) -> broadcast::Receiver<BroadcasterStatus> {
        self.statuses.subscribe()
    }

    /// Message batches from now on.
    pub fn messages(&self) -> broadcast::Receiver<Vec<MessageEvent>> {
        self.messages.subscribe()
    }

    pub fn subscribe<I, S>(&self, channels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Command::Subscribe(collect(channels)));
    }

    pub fn unsubscribe<I, S>(&self, channels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Command::Unsubscribe(collect(channels)));
    }

    /// Overrides the catch-up checkpoint.
    pub fn set_last_message_received_at(&self, timestamp: i64) {
        self.send(Command::SetLastMessageReceivedAt(timestamp));
    }

    /// Drops incoming live messages while enabled.
    pub fn simulate_offline(&self, enabled: bool) {
        self.send(Command::SimulateOffline(enabled));
    }

    /// Makes every confirm report all channels in doubt while enabled.
    pub fn simulate_confirm_failure(&self, enabled: bool) {
        self.send(Command::SimulateConfirmFailure(enabled));
    }

    /// Ignores the next `Connected` from the transport.
    pub fn simulate_subscription_timeout(&self) {
        self.send(Command::SimulateSubscriptionTimeout);
    }

    /// Suspends the liveness tick long enough to look like the machine slept.
    pub fn simulate_long_tick(&self) {
        self.send(Command::SimulateLongTick);
    }

    /// Reports a network hiccup after `delay`.
    pub fn simulate_network_error(&self, delay: Duration) {
        self.send(Command::SimulateNetworkError(delay));
    }

    /// Unsubscribes everything, disconnects the transport and stops the
    /// orchestrator. Returns once it has stopped.
    pub async fn dispose(self) {
        let (done, stopped) = oneshot::channel();
        if self.commands.send(Command::Dispose(done)).is_ok() {
            let _ = stopped.await;
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Broadcaster already stopped");
        }
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        // fails harmlessly after dispose()
        let (done, _) = oneshot::channel();
        let _ = self.commands.send(Command::Dispose(done));
    }
}

fn collect<I, S>(channels: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    channels.into_iter().map(Into::into).collect()
}
