//! Pull-model adapter: PubNub subscribe long-polls, presence heartbeats and
//! presence-based subscription confirmation.

pub mod history;
pub mod rest;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::error::{HistoryError, TransportError};
use crate::history::{HistoryOutput, HistoryRequest};

use super::retry::RetryPolicy;
use super::{
    send_message, send_status, ConfirmResult, SubscribeOptions, Transport, TransportEventSender,
    TransportStatus,
};

pub use history::{PubnubHistory, PubnubHistoryApi};
pub use rest::{PubnubRest, PubnubSettings};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Channel name to "the backend acknowledged this subscription".
type ChannelTable = Arc<Mutex<HashMap<String, bool>>>;

fn lock(table: &ChannelTable) -> MutexGuard<'_, HashMap<String, bool>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
enum PollCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Reconnect,
    Shutdown,
}

pub struct PubnubConnection {
    rest: Arc<PubnubRest>,
    clock: Arc<dyn Clock>,
    channels: ChannelTable,
    events: TransportEventSender,
    commands: mpsc::UnboundedSender<PollCommand>,
    heartbeat: JoinHandle<()>,
}

impl PubnubConnection {
    /// Builds the REST client and starts the poll and heartbeat tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(
        settings: PubnubSettings,
        clock: Arc<dyn Clock>,
        events: TransportEventSender,
    ) -> Result<Self, TransportError> {
        let rest = Arc::new(PubnubRest::new(settings)?);
        let channels: ChannelTable = Arc::new(Mutex::new(HashMap::new()));
        let offline = Arc::new(AtomicBool::new(false));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let poller = Poller {
            rest: Arc::clone(&rest),
            channels: Arc::clone(&channels),
            events: events.clone(),
            offline: Arc::clone(&offline),
            commands: command_rx,
            retry: RetryPolicy::default(),
            active: BTreeSet::new(),
            handshake: BTreeSet::new(),
            cursor: None,
            failures: 0,
        };
        tokio::spawn(poller.run());

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&rest),
            Arc::clone(&channels),
            offline,
            events.clone(),
        ));

        log::info!("PubNub transport started for user {}", rest.user_id());

        Ok(Self {
            rest,
            clock,
            channels,
            events,
            commands,
            heartbeat,
        })
    }

    fn command(&self, command: PollCommand) {
        if self.commands.send(command).is_err() {
            log::debug!("PubNub poll task has stopped");
        }
    }
}

#[async_trait]
impl Transport for PubnubConnection {
    fn subscribe(&self, channels: &[String], options: &SubscribeOptions) {
        let mut confirmed = Vec::new();
        let mut requested = Vec::new();
        {
            let mut table = lock(&self.channels);
            for channel in channels {
                match table.get(channel) {
                    Some(true) => confirmed.push(channel.clone()),
                    Some(false) => requested.push(channel.clone()),
                    None => {
                        table.insert(channel.clone(), false);
                        requested.push(channel.clone());
                    }
                }
            }
        }

        if !confirmed.is_empty() {
            send_status(&self.events, TransportStatus::Connected(confirmed));
        }
        if !requested.is_empty() {
            // presence is always announced through the heartbeat parameter
            log::debug!(
                "Subscribing to {} PubNub channels (presence: {})",
                requested.len(),
                options.with_presence
            );
            self.command(PollCommand::Subscribe(requested));
        }
    }

    fn unsubscribe(&self, channels: &[String]) {
        {
            let mut table = lock(&self.channels);
            for channel in channels {
                table.remove(channel);
            }
        }
        self.command(PollCommand::Unsubscribe(channels.to_vec()));
    }

    fn reconnect(&self) {
        self.command(PollCommand::Reconnect);
    }

    async fn confirm_subscriptions(&self, channels: &[String]) -> ConfirmResult {
        match self.rest.here_now(channels).await {
            Ok(occupants) => {
                let user_id = self.rest.user_id();
                let missing: Vec<String> = channels
                    .iter()
                    .filter(|channel| {
                        !occupants
                            .get(channel.as_str())
                            .is_some_and(|uuids| uuids.iter().any(|uuid| uuid == user_id))
                    })
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    log::info!("PubNub presence is missing {} channels", missing.len());
                }
                ConfirmResult::Specific(missing)
            }
            Err(e) => {
                log::warn!("PubNub presence check failed: {}", e);
                ConfirmResult::AllInDoubt
            }
        }
    }

    async fn fetch_history(&self, request: HistoryRequest) -> Result<HistoryOutput, HistoryError> {
        PubnubHistory::new(self.rest.as_ref(), self.clock.as_ref())
            .fetch(&request)
            .await
    }

    fn disconnect(&self) {
        self.command(PollCommand::Shutdown);
        self.heartbeat.abort();
    }
}

impl Drop for PubnubConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

enum Step {
    Command(Option<PollCommand>),
    Poll(Result<rest::SubscribeResponse, TransportError>),
}

/// Owns the subscribe long-poll. Restarts the poll whenever the channel set changes.
struct Poller {
    rest: Arc<PubnubRest>,
    channels: ChannelTable,
    events: TransportEventSender,
    offline: Arc<AtomicBool>,
    commands: mpsc::UnboundedReceiver<PollCommand>,
    retry: RetryPolicy,
    active: BTreeSet<String>,
    /// Channels added since the last successful poll.
    handshake: BTreeSet<String>,
    cursor: Option<rest::Timetoken>,
    failures: u32,
}

impl Poller {
    async fn run(mut self) {
        loop {
            if self.active.is_empty() {
                match self.commands.recv().await {
                    None | Some(PollCommand::Shutdown) => break,
                    Some(command) => {
                        self.apply(command);
                        continue;
                    }
                }
            }

            let channels: Vec<String> = self.active.iter().cloned().collect();
            let handshake = !self.handshake.is_empty() || self.cursor.is_none();
            let (timetoken, region) = match (&self.cursor, handshake) {
                (Some(cursor), false) => (cursor.t, cursor.r),
                _ => (0, 0),
            };
            let rest = Arc::clone(&self.rest);

            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                result = rest.subscribe(&channels, timetoken, region) => Step::Poll(result),
            };

            match step {
                Step::Command(None | Some(PollCommand::Shutdown)) => break,
                Step::Command(Some(command)) => self.apply(command),
                Step::Poll(result) => {
                    if !self.handle_poll(result, handshake).await {
                        break;
                    }
                }
            }
        }

        self.leave_all().await;
        log::debug!("PubNub poll task stopped");
    }

    fn apply(&mut self, command: PollCommand) {
        match command {
            PollCommand::Subscribe(channels) => {
                for channel in channels {
                    self.active.insert(channel.clone());
                    self.handshake.insert(channel);
                }
            }
            PollCommand::Unsubscribe(channels) => {
                for channel in &channels {
                    self.active.remove(channel);
                    self.handshake.remove(channel);
                }
                let rest = Arc::clone(&self.rest);
                tokio::spawn(async move {
                    if let Err(e) = rest.leave(&channels).await {
                        log::debug!("PubNub leave failed: {}", e);
                    }
                });
            }
            PollCommand::Reconnect => log::debug!("Restarting PubNub subscribe poll"),
            PollCommand::Shutdown => {}
        }
    }

    /// Returns false when the task should stop.
    async fn handle_poll(
        &mut self,
        result: Result<rest::SubscribeResponse, TransportError>,
        handshake: bool,
    ) -> bool {
        match result {
            Ok(response) => {
                self.failures = 0;
                if self.offline.swap(false, Ordering::AcqRel) {
                    log::info!("PubNub connection restored");
                    send_status(&self.events, TransportStatus::NetworkProblem);
                }

                if handshake {
                    // keep an existing cursor so messages on already joined channels are not skipped
                    if self.cursor.is_none() {
                        self.cursor = Some(response.t);
                    }
                    let confirmed: Vec<String> = std::mem::take(&mut self.handshake)
                        .into_iter()
                        .filter(|channel| self.active.contains(channel))
                        .collect();
                    {
                        let mut table = lock(&self.channels);
                        for channel in &confirmed {
                            if let Some(acknowledged) = table.get_mut(channel) {
                                *acknowledged = true;
                            }
                        }
                    }
                    if !confirmed.is_empty() {
                        send_status(&self.events, TransportStatus::Connected(confirmed));
                    }
                } else {
                    self.cursor = Some(response.t);
                    for envelope in response.m {
                        send_message(
                            &self.events,
                            rest::timetoken_to_timestamp(envelope.p.t),
                            envelope.d,
                        );
                    }
                }
                true
            }
            Err(TransportError::Status { status: 403, body }) => {
                match rest::access_denied_channels(&body) {
                    Some(denied) => {
                        let denied = if denied.is_empty() {
                            self.active.iter().cloned().collect()
                        } else {
                            denied
                        };
                        log::warn!("PubNub denied access to {} channels", denied.len());
                        self.drop_channels(&denied);
                        send_status(&self.events, TransportStatus::Failed(denied));
                    }
                    None => {
                        log::error!("Unreadable PubNub access denial: {}", body);
                        let all: Vec<String> = self.active.iter().cloned().collect();
                        self.drop_channels(&all);
                        send_status(&self.events, TransportStatus::Reset);
                    }
                }
                true
            }
            Err(err) => {
                let unreachable =
                    matches!(&err, TransportError::Request(e) if e.is_connect() || e.is_timeout());
                if unreachable {
                    if !self.offline.swap(true, Ordering::AcqRel) {
                        log::warn!("PubNub is unreachable: {}", err);
                        self.go_offline();
                        send_status(&self.events, TransportStatus::Offline);
                    }
                } else {
                    log::warn!("PubNub subscribe failed: {}", err);
                    send_status(&self.events, TransportStatus::NetworkProblem);
                }
                self.backoff().await
            }
        }
    }

    /// Waits before the next attempt, still honouring commands.
    async fn backoff(&mut self) -> bool {
        let delay = self.retry.delay_for_attempt(self.failures);
        self.failures = self.failures.saturating_add(1);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            let command = tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => command,
            };
            match command {
                None | Some(PollCommand::Shutdown) => return false,
                Some(command) => self.apply(command),
            }
        }
    }

    /// Every channel has to be re-acknowledged once the network returns.
    fn go_offline(&mut self) {
        self.cursor = None;
        self.handshake.extend(self.active.iter().cloned());
        let mut table = lock(&self.channels);
        for acknowledged in table.values_mut() {
            *acknowledged = false;
        }
    }

    fn drop_channels(&mut self, channels: &[String]) {
        let mut table = lock(&self.channels);
        for channel in channels {
            self.active.remove(channel);
            self.handshake.remove(channel);
            table.remove(channel);
        }
    }

    async fn leave_all(&mut self) {
        if self.active.is_empty() {
            return;
        }
        let channels: Vec<String> = std::mem::take(&mut self.active).into_iter().collect();
        if let Err(e) = self.rest.leave(&channels).await {
            log::debug!("PubNub leave on shutdown failed: {}", e);
        }
    }
}

async fn heartbeat_loop(
    rest: Arc<PubnubRest>,
    channels: ChannelTable,
    offline: Arc<AtomicBool>,
    events: TransportEventSender,
) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.tick().await; // skip immediate first tick

    loop {
        ticker.tick().await;
        if offline.load(Ordering::Acquire) {
            continue;
        }
        let subscribed: Vec<String> = lock(&channels)
            .iter()
            .filter(|(_, acknowledged)| **acknowledged)
            .map(|(channel, _)| channel.clone())
            .collect();
        if subscribed.is_empty() {
            continue;
        }
        if let Err(e) = rest.heartbeat(&subscribed).await {
            log::warn!("PubNub heartbeat failed: {}", e);
            send_status(&events, TransportStatus::NetworkProblem);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::transport::{event_channel, TransportEvent};
    use secrecy::SecretString;

    fn settings() -> PubnubSettings {
        PubnubSettings {
            origin: "127.0.0.1:9".to_string(),
            subscribe_key: "sub-c-test".to_string(),
            auth_key: SecretString::from("auth".to_string()),
            user_id: "user-9".to_string(),
            strict_ssl: true,
            proxy_url: None,
        }
    }

    #[tokio::test]
    async fn test_acknowledged_channels_connect_immediately() {
        let (tx, mut rx) = event_channel();
        let connection = PubnubConnection::connect(settings(), Arc::new(SystemClock), tx).unwrap();
        lock(&connection.channels).insert("team-5".to_string(), true);

        connection.subscribe(&["team-5".to_string()], &SubscribeOptions::default());

        assert_eq!(
            rx.recv().await.unwrap(),
            TransportEvent::Status(TransportStatus::Connected(vec!["team-5".to_string()]))
        );
        connection.disconnect();
    }

    #[tokio::test]
    async fn test_unsubscribe_forgets_channels() {
        let (tx, _rx) = event_channel();
        let connection = PubnubConnection::connect(settings(), Arc::new(SystemClock), tx).unwrap();
        lock(&connection.channels).insert("team-5".to_string(), true);

        connection.unsubscribe(&["team-5".to_string()]);

        assert!(lock(&connection.channels).is_empty());
        connection.disconnect();
    }

    #[test]
    fn test_invalid_proxy_is_rejected() {
        let mut settings = settings();
        settings.proxy_url = Some("::not a proxy::".to_string());
        assert!(PubnubRest::new(settings).is_err());
    }
}
