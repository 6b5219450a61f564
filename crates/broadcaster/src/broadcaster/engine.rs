//! The orchestrator task.
//!
//! One task owns every piece of subscription state. It reacts to caller
//! commands, transport events, the liveness tick, the subscribe timeout and the
//! completions of the history and confirm requests it spawns. Nothing else
//! mutates the state, so no locking is needed.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::broadcast::{
    BroadcasterStatus, BroadcasterStatusType, MessageBroadcaster, MessageEvent, StatusBroadcaster,
};
use crate::clock::Clock;
use crate::error::HistoryError;
use crate::history::{HistoryOutput, HistoryRequest};
use crate::transport::{
    ConfirmResult, SubscribeOptions, Transport, TransportEvent, TransportEventReceiver,
    TransportStatus,
};

use super::catchup::{catch_up_since, exceeds_retention};
use super::dedup::MessageDedupCache;
use super::partial::PartialMessageBuffer;
use super::subscriptions::SubscriptionMap;
use super::throttle::{throttle_interval, ABORT_AFTER_RESUBSCRIBES};

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// A gap between ticks longer than this means the machine slept.
pub const LONG_TICK_MS: i64 = 10_000;
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
/// How long `simulate_long_tick` suspends the tick.
pub const LONG_TICK_PAUSE: Duration = Duration::from_secs(11);

#[derive(Debug)]
pub(crate) enum Command {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    SimulateOffline(bool),
    SimulateConfirmFailure(bool),
    SimulateSubscriptionTimeout,
    SimulateLongTick,
    SimulateNetworkError(Duration),
    SetLastMessageReceivedAt(i64),
    Dispose(oneshot::Sender<()>),
}

/// Completions reported back to the task. `epoch` drops results that
/// outlived a reset.
enum Internal {
    CatchUpFinished {
        epoch: u64,
        channels: Vec<String>,
        result: Result<HistoryOutput, HistoryError>,
    },
    ConfirmFinished {
        epoch: u64,
        channels: Vec<String>,
        result: ConfirmResult,
    },
    Resubscribe {
        epoch: u64,
        channels: Vec<String>,
    },
    NetworkError,
    ResumeTicking,
}

enum Step {
    Command(Option<Command>),
    Transport(TransportEvent),
    Internal(Internal),
    Tick,
    StatusTimeout,
}

pub(crate) struct EngineOptions {
    pub test_mode: bool,
    /// 0 when nothing has been received yet.
    pub last_message_received_at: i64,
    pub initialization_started_at: i64,
}

pub(crate) struct Outputs {
    pub statuses: StatusBroadcaster,
    pub messages: MessageBroadcaster,
}

struct Engine {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    outputs: Outputs,
    internal: mpsc::UnboundedSender<Internal>,

    subscriptions: SubscriptionMap,
    queue: Vec<String>,
    active_failures: Vec<String>,
    dedup: MessageDedupCache,
    partials: PartialMessageBuffer,

    pending: bool,
    need_connected: bool,
    had_trouble: bool,
    aborted: bool,
    catching_up: bool,
    catch_up_again: bool,
    confirming: bool,
    epoch: u64,

    resubscribes: u32,
    last_successful_subscription: i64,
    last_message_received_at: i64,
    initialization_started_at: i64,
    last_tick: i64,
    ticking: bool,
    status_deadline: Option<Instant>,

    test_mode: bool,
    simulate_offline: bool,
    simulate_confirm_failure: bool,
    simulate_subscription_timeout: bool,
}

/// Starts the orchestrator task.
pub(crate) fn spawn(
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    outputs: Outputs,
    options: EngineOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    events: TransportEventReceiver,
) -> JoinHandle<()> {
    let (internal, internal_rx) = mpsc::unbounded_channel();
    let engine = Engine {
        transport,
        clock,
        outputs,
        internal,
        subscriptions: SubscriptionMap::default(),
        queue: Vec::new(),
        active_failures: Vec::new(),
        dedup: MessageDedupCache::default(),
        partials: PartialMessageBuffer::default(),
        pending: false,
        need_connected: false,
        had_trouble: false,
        aborted: false,
        catching_up: false,
        catch_up_again: false,
        confirming: false,
        epoch: 0,
        resubscribes: 0,
        last_successful_subscription: 0,
        last_message_received_at: options.last_message_received_at,
        initialization_started_at: options.initialization_started_at,
        last_tick: 0,
        ticking: true,
        status_deadline: None,
        test_mode: options.test_mode,
        simulate_offline: false,
        simulate_confirm_failure: false,
        simulate_subscription_timeout: false,
    };
    tokio::spawn(engine.run(commands, events, internal_rx))
}

impl Engine {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: TransportEventReceiver,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.status_deadline;
            let step = tokio::select! {
                command = commands.recv() => Step::Command(command),
                Some(event) = events.recv() => Step::Transport(event),
                Some(message) = internal.recv() => Step::Internal(message),
                _ = ticker.tick(), if self.ticking => Step::Tick,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    Step::StatusTimeout
                }
            };

            match step {
                Step::Command(None) => {
                    self.dispose();
                    break;
                }
                Step::Command(Some(Command::Dispose(done))) => {
                    self.dispose();
                    let _ = done.send(());
                    break;
                }
                Step::Command(Some(command)) => self.handle_command(command),
                Step::Transport(event) => self.handle_transport_event(event),
                Step::Internal(Internal::ResumeTicking) => {
                    if !self.aborted {
                        ticker.reset_immediately();
                        self.ticking = true;
                    }
                }
                Step::Internal(message) => self.handle_internal(message),
                Step::Tick => self.tick(),
                Step::StatusTimeout => self.subscription_timeout(),
            }
        }

        tracing::debug!("Broadcaster stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe(channels) => self.subscribe(channels),
            Command::Unsubscribe(channels) => self.unsubscribe(channels),
            Command::SimulateOffline(enabled) => self.simulate_offline = enabled,
            Command::SimulateConfirmFailure(enabled) => self.simulate_confirm_failure = enabled,
            Command::SimulateSubscriptionTimeout => self.simulate_subscription_timeout = true,
            Command::SimulateLongTick => {
                self.ticking = false;
                self.after(LONG_TICK_PAUSE, Internal::ResumeTicking);
            }
            Command::SimulateNetworkError(delay) => self.after(delay, Internal::NetworkError),
            Command::SetLastMessageReceivedAt(timestamp) => self.last_message_received_at = timestamp,
            // handled by the run loop
            Command::Dispose(_) => {}
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => self.on_message(message.received_at, message.message),
            TransportEvent::Status(TransportStatus::Connected(channels)) => self.set_connected(channels),
            TransportEvent::Status(TransportStatus::Failed(channels)) => self.subscription_failure(channels),
            TransportEvent::Status(TransportStatus::NetworkProblem) => self.net_hiccup(),
            TransportEvent::Status(TransportStatus::Offline) => {
                // the caller hears Connected again once we are back
                self.had_trouble = true;
                self.need_connected = true;
                self.emit(BroadcasterStatusType::Offline, None);
            }
            TransportEvent::Status(TransportStatus::Reset) => self.reset(),
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            // the flags belong to the current epoch; reset already cleared them
            Internal::CatchUpFinished { epoch, channels, result } => {
                if epoch == self.epoch {
                    self.catching_up = false;
                    self.finish_catch_up(channels, result);
                }
            }
            Internal::ConfirmFinished { epoch, channels, result } => {
                if epoch == self.epoch {
                    self.confirming = false;
                    self.finish_confirm(channels, result);
                }
            }
            Internal::Resubscribe { epoch, channels } => {
                if epoch == self.epoch {
                    self.resubscribe(channels);
                }
            }
            Internal::NetworkError => self.net_hiccup(),
            Internal::ResumeTicking => {}
        }
    }

    fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Delivers `message` to the task after `delay`.
    fn after(&self, delay: Duration, message: Internal) {
        let internal = self.internal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(message);
        });
    }

    // ---- subscribing ----

    fn subscribe(&mut self, channels: Vec<String>) {
        tracing::debug!(?channels, "Request to subscribe");
        if self.aborted {
            tracing::debug!("Broadcaster is aborted");
            self.emit(BroadcasterStatusType::Aborted, None);
            return;
        }
        if self.pending {
            tracing::debug!(?channels, "Subscriptions pending, queueing");
            if self.test_mode {
                self.emit(BroadcasterStatusType::Queued, Some(channels.clone()));
            }
            self.queue.extend(channels);
            return;
        }
        self.subscribe_to_channels(channels);
    }

    fn unsubscribe(&mut self, channels: Vec<String>) {
        tracing::debug!(?channels, "Request to unsubscribe");
        self.transport.unsubscribe(&channels);
        self.subscriptions.remove(&channels);
        self.queue.retain(|channel| !channels.contains(channel));
        self.active_failures.retain(|channel| !channels.contains(channel));

        // the cycle may have been waiting only on the removed channels
        if self.pending
            && self.status_deadline.is_some()
            && self.subscriptions.unsubscribed().is_empty()
        {
            self.status_deadline = None;
            self.catch_up();
        }
    }

    fn subscribe_to_channels(&mut self, channels: Vec<String>) {
        if self.subscriptions.add(&channels) > 0 {
            self.need_connected = true;
        }
        self.pending = true;
        self.subscribe_all();
    }

    fn subscribe_all(&mut self) {
        let channels = self.subscriptions.unsubscribed();
        if channels.is_empty() {
            tracing::debug!("No unsubscribed channels, fully subscribed");
            self.subscribed();
            return;
        }

        // a fresh attempt for these channels
        self.active_failures.retain(|channel| !channels.contains(channel));
        tracing::debug!(?channels, "Subscribing");
        self.transport.subscribe(&channels, &SubscribeOptions::default());

        if self.status_deadline.is_none() {
            self.status_deadline = Some(Instant::now() + STATUS_TIMEOUT);
        }
    }

    fn set_connected(&mut self, channels: Vec<String>) {
        if self.simulate_subscription_timeout {
            tracing::debug!(?channels, "Simulating subscription timeout, ignoring Connected");
            self.simulate_subscription_timeout = false;
            return;
        }
        tracing::debug!(?channels, "Channels connected");
        if self.subscriptions.mark_subscribed(&channels) == 0 {
            return;
        }
        if self.subscriptions.unsubscribed().is_empty() {
            self.status_deadline = None;
            self.catch_up();
        }
    }

    fn subscription_timeout(&mut self) {
        self.status_deadline = None;
        let failed = self.subscriptions.unsubscribed();
        if failed.is_empty() {
            self.catch_up();
            return;
        }
        tracing::info!(channels = ?failed, "Subscription timed out");
        self.subscription_failure(failed);
    }

    fn subscription_failure(&mut self, failed: Vec<String>) {
        let channels: Vec<String> = failed
            .into_iter()
            .filter(|channel| {
                self.subscriptions.contains(channel) && !self.active_failures.contains(channel)
            })
            .collect();
        if channels.is_empty() {
            tracing::debug!("Already handling these subscription failures");
            return;
        }

        self.active_failures.extend(channels.iter().cloned());
        self.emit_trouble(Some(channels.clone()));

        // a bad token never subscribes anything; stop retrying eventually
        if self.subscriptions.subscribed().is_empty()
            && self.last_successful_subscription == 0
            && self.resubscribes >= ABORT_AFTER_RESUBSCRIBES
        {
            self.abort();
            return;
        }

        let interval = throttle_interval(self.resubscribes);
        tracing::debug!(?channels, ?interval, "Scheduling resubscribe");
        let epoch = self.epoch;
        self.after(interval, Internal::Resubscribe { epoch, channels });
    }

    fn resubscribe(&mut self, channels: Vec<String>) {
        if self.aborted {
            return;
        }
        self.resubscribes = self.resubscribes.saturating_add(1);
        tracing::debug!(?channels, resubscribes = self.resubscribes, "Resubscribing");
        self.subscriptions.mark_unsubscribed(&channels);
        self.pending = true;
        self.drain_queue();
    }

    fn drain_queue(&mut self) {
        let channels = std::mem::take(&mut self.queue);
        if !channels.is_empty() {
            tracing::debug!(?channels, "Draining subscription queue");
        }
        self.subscribe_to_channels(channels);
    }

    /// Every requested channel is subscribed and caught up.
    fn subscribed(&mut self) {
        if !self.queue.is_empty() {
            self.drain_queue();
            return;
        }

        self.active_failures.clear();
        self.pending = false;
        if !self.subscriptions.subscribed().is_empty() {
            self.last_successful_subscription = self.now();
            self.resubscribes = 0;
        }
        if self.need_connected && !self.subscriptions.is_empty() {
            self.emit_connected();
        }
    }

    fn abort(&mut self) {
        tracing::warn!(
            "All subscriptions failed after {} retries, aborting",
            ABORT_AFTER_RESUBSCRIBES
        );
        let never_subscribed = self.subscriptions.unsubscribed();
        if !never_subscribed.is_empty() {
            self.emit(BroadcasterStatusType::Failed, Some(never_subscribed));
        }
        self.aborted = true;
        self.ticking = false;
        self.unsubscribe_all();
        self.emit(BroadcasterStatusType::Aborted, None);
    }

    fn reset(&mut self) {
        tracing::info!("Resetting all subscriptions");
        self.unsubscribe_all();
        self.emit(BroadcasterStatusType::Reset, None);
    }

    fn unsubscribe_all(&mut self) {
        let channels = self.subscriptions.all();
        if !channels.is_empty() {
            self.transport.unsubscribe(&channels);
        }
        self.subscriptions.clear();
        self.queue.clear();
        self.active_failures.clear();
        self.status_deadline = None;
        self.pending = false;
        self.need_connected = false;
        self.had_trouble = false;
        self.catching_up = false;
        self.catch_up_again = false;
        self.confirming = false;
        self.epoch += 1;
    }

    fn dispose(&mut self) {
        tracing::debug!("Disposing broadcaster");
        self.ticking = false;
        self.unsubscribe_all();
        self.transport.disconnect();
    }

    // ---- network trouble ----

    fn tick(&mut self) {
        let now = self.now();
        if self.last_tick > 0 && now - self.last_tick > LONG_TICK_MS {
            tracing::info!(gap_ms = now - self.last_tick, "Long tick detected");
            self.net_hiccup();
        }
        self.last_tick = now;
    }

    fn net_hiccup(&mut self) {
        if self.aborted {
            return;
        }
        if self.pending {
            tracing::debug!("Ignoring network hiccup, subscriptions already pending");
            return;
        }
        if !self.active_failures.is_empty() {
            tracing::debug!("Ignoring network hiccup, failures already being handled");
            return;
        }
        self.pending = true;
        if self.test_mode {
            self.emit(BroadcasterStatusType::NetworkProblem, None);
        }
        tracing::info!("Network hiccup, confirming subscriptions");
        self.confirm_subscriptions();
    }

    fn confirm_subscriptions(&mut self) {
        if self.confirming {
            return;
        }
        let channels = self.subscriptions.subscribed();
        if channels.is_empty() {
            tracing::debug!("No subscribed channels to confirm");
            self.subscribed();
            return;
        }
        if self.simulate_confirm_failure {
            tracing::debug!("Simulating a confirm failure");
            self.finish_confirm(channels, ConfirmResult::AllInDoubt);
            return;
        }

        self.confirming = true;
        let transport = Arc::clone(&self.transport);
        let internal = self.internal.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = transport.confirm_subscriptions(&channels).await;
            let _ = internal.send(Internal::ConfirmFinished { epoch, channels, result });
        });
    }

    fn finish_confirm(&mut self, channels: Vec<String>, result: ConfirmResult) {
        let trouble = result.trouble_channels(&channels);
        if !trouble.is_empty() {
            tracing::info!(channels = ?trouble, "Failed to confirm subscriptions");
            self.subscription_failure(trouble);
            return;
        }
        if self.test_mode {
            self.emit(BroadcasterStatusType::Confirmed, None);
        }
        tracing::debug!("Subscriptions confirmed, reconnecting and catching up");
        self.transport.reconnect();
        self.catch_up();
    }

    // ---- catch-up ----

    fn catch_up(&mut self) {
        if self.catching_up {
            self.catch_up_again = true;
            return;
        }
        let channels = self.subscriptions.subscribed();
        if channels.is_empty() {
            tracing::debug!("No channels to catch up with");
            self.subscribed();
            return;
        }

        let since = catch_up_since(self.last_message_received_at, self.initialization_started_at);
        if exceeds_retention(self.now(), since, self.transport.retention()) {
            tracing::info!(since, "Been away too long to catch up, forcing reset");
            self.reset();
            return;
        }

        self.catching_up = true;
        let transport = Arc::clone(&self.transport);
        let internal = self.internal.clone();
        let epoch = self.epoch;
        let span = tracing::info_span!("catch_up", channels = channels.len(), since);
        tokio::spawn(
            async move {
                let request = HistoryRequest {
                    channels: channels.clone(),
                    since,
                };
                let result = transport.fetch_history(request).await;
                let _ = internal.send(Internal::CatchUpFinished { epoch, channels, result });
            }
            .instrument(span),
        );
    }

    fn finish_catch_up(&mut self, channels: Vec<String>, result: Result<HistoryOutput, HistoryError>) {
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(retryable = e.is_retryable(), "Fetch history failed, resubscribing: {}", e);
                self.catch_up_again = false;
                self.emit_trouble(None);
                self.resubscribe(channels);
                return;
            }
        };

        if output.reset {
            tracing::info!("Too much history, forcing reset");
            self.reset();
            return;
        }

        if !output.messages.is_empty() {
            if let Some(timestamp) = output.timestamp {
                self.last_message_received_at = timestamp;
            }
            let received = output.messages.len();
            let batch: Vec<MessageEvent> = output
                .messages
                .into_iter()
                .filter_map(|m| self.intake(m.timestamp, m.message))
                .collect();
            let now = self.now();
            self.dedup.purge(now);
            tracing::info!(received, delivered = batch.len(), "Caught up on missed messages");
            self.outputs.messages.send(batch);
        }

        if std::mem::take(&mut self.catch_up_again) {
            self.catch_up();
            return;
        }
        self.subscribed();
    }

    // ---- messages ----

    fn on_message(&mut self, received_at: i64, message: Value) {
        if self.simulate_offline {
            return;
        }
        if received_at > self.last_message_received_at && !self.pending {
            self.last_message_received_at = received_at;
        }
        if let Some(event) = self.intake(received_at, message) {
            self.outputs.messages.send(vec![event]);
        }
        let now = self.now();
        self.dedup.purge(now);
    }

    /// Dedup and partial reassembly. Returns the event to deliver, if any.
    fn intake(&mut self, received_at: i64, message: Value) -> Option<MessageEvent> {
        if let Some(message_id) = message.get("messageId").and_then(Value::as_str) {
            if !self.dedup.record(message_id, self.clock.now_ms()) {
                tracing::trace!(message_id, "Dropping duplicate message");
                return None;
            }
        }
        self.partials
            .accept(message)
            .map(|full| MessageEvent::new(received_at, full))
    }

    // ---- statuses ----

    fn emit(&self, status: BroadcasterStatusType, channels: Option<Vec<String>>) {
        tracing::debug!(%status, ?channels, "Emitting status");
        let status = match channels {
            Some(channels) => BroadcasterStatus::with_channels(status, channels),
            None => BroadcasterStatus::new(status),
        };
        self.outputs.statuses.send(status);
    }

    fn emit_trouble(&mut self, channels: Option<Vec<String>>) {
        self.had_trouble = true;
        self.need_connected = true;
        self.emit(BroadcasterStatusType::Trouble, channels);
    }

    fn emit_connected(&mut self) {
        let channels = self.subscriptions.all();
        tracing::info!(?channels, reconnected = self.had_trouble, "Connected");
        self.outputs
            .statuses
            .send(BroadcasterStatus::connected(channels, self.had_trouble));
        self.need_connected = false;
        self.had_trouble = false;
    }
}
