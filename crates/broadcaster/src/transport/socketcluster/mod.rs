//! Push-model adapter over a SocketCluster WebSocket.
//!
//! Subscriptions are confirmed by per-channel acknowledgements, so the adapter
//! keeps its own table of what the server has acknowledged and answers
//! `confirm_subscriptions` from it.

pub mod history;
pub mod protocol;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

use crate::clock::Clock;
use crate::error::{HistoryError, TransportError};
use crate::history::{HistoryOutput, HistoryRequest};

use super::retry::RetryPolicy;
use super::{
    send_message, send_status, ConfirmResult, SubscribeOptions, Transport, TransportEventSender,
    TransportStatus,
};

pub use history::{HistoryRpc, SocketClusterHistory};
use protocol::{HistoryQuery, HistoryReply, IncomingFrame};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct SocketClusterSettings {
    /// `wss://host:port/socketcluster/`
    pub url: String,
    pub auth_key: SecretString,
    pub user_id: String,
    pub strict_ssl: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Requested,
    Acknowledged,
    Failed,
}

type ChannelTable = Arc<Mutex<HashMap<String, ChannelState>>>;
type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<HistoryReply>>>>;

fn lock<T>(shared: &Mutex<T>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
enum SocketCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Emit { request_id: String, frame: String },
    Shutdown,
}

pub struct SocketClusterConnection {
    clock: Arc<dyn Clock>,
    channels: ChannelTable,
    replies: PendingReplies,
    events: TransportEventSender,
    commands: mpsc::UnboundedSender<SocketCommand>,
}

impl SocketClusterConnection {
    /// Opens and authorizes the socket, then hands it to a background task.
    ///
    /// Fails if the server can't be reached, or rejects the credentials,
    /// within [`CONNECT_TIMEOUT`].
    pub async fn connect(
        settings: SocketClusterSettings,
        clock: Arc<dyn Clock>,
        events: TransportEventSender,
    ) -> Result<Self, TransportError> {
        log::debug!("Connecting to SocketCluster at {}", settings.url);
        let session = tokio::time::timeout(CONNECT_TIMEOUT, open_session(&settings))
            .await
            .map_err(|_| TransportError::ConnectTimeout(CONNECT_TIMEOUT.as_secs()))??;
        log::info!("SocketCluster authorized user {}", settings.user_id);

        let channels: ChannelTable = Arc::new(Mutex::new(HashMap::new()));
        let replies: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let task = SocketTask {
            settings,
            clock: Arc::clone(&clock),
            channels: Arc::clone(&channels),
            replies: Arc::clone(&replies),
            events: events.clone(),
            commands: command_rx,
            retry: RetryPolicy::default(),
            next_cid: session.next_cid,
            in_flight: HashMap::new(),
        };
        tokio::spawn(task.run(session.ws));

        Ok(Self {
            clock,
            channels,
            replies,
            events,
            commands,
        })
    }

    fn command(&self, command: SocketCommand) -> bool {
        if self.commands.send(command).is_err() {
            log::debug!("SocketCluster task has stopped");
            return false;
        }
        true
    }
}

/// Removes a history waiter if its request is abandoned.
struct PendingReply {
    request_id: String,
    replies: PendingReplies,
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        lock(&self.replies).remove(&self.request_id);
    }
}

#[async_trait]
impl HistoryRpc for SocketClusterConnection {
    async fn request_history(&self, query: HistoryQuery) -> Result<HistoryReply, HistoryError> {
        let (tx, rx) = oneshot::channel();
        lock(&self.replies).insert(query.request_id.clone(), tx);
        let _pending = PendingReply {
            request_id: query.request_id.clone(),
            replies: Arc::clone(&self.replies),
        };

        let frame = protocol::history_request(&query);
        if !self.command(SocketCommand::Emit {
            request_id: query.request_id,
            frame,
        }) {
            return Err(TransportError::Closed.into());
        }
        rx.await.map_err(|_| HistoryError::Transport(TransportError::Closed))
    }
}

#[async_trait]
impl Transport for SocketClusterConnection {
    fn subscribe(&self, channels: &[String], options: &SubscribeOptions) {
        let mut acknowledged = Vec::new();
        let mut requested = Vec::new();
        {
            let mut table = lock(&self.channels);
            for channel in channels {
                if table.get(channel) == Some(&ChannelState::Acknowledged) {
                    acknowledged.push(channel.clone());
                } else {
                    table.insert(channel.clone(), ChannelState::Requested);
                    requested.push(channel.clone());
                }
            }
        }

        if !acknowledged.is_empty() {
            send_status(&self.events, TransportStatus::Connected(acknowledged));
        }
        if !requested.is_empty() {
            log::debug!(
                "Subscribing to {} SocketCluster channels (presence: {})",
                requested.len(),
                options.with_presence
            );
            self.command(SocketCommand::Subscribe(requested));
        }
    }

    fn unsubscribe(&self, channels: &[String]) {
        {
            let mut table = lock(&self.channels);
            for channel in channels {
                table.remove(channel);
            }
        }
        self.command(SocketCommand::Unsubscribe(channels.to_vec()));
    }

    /// The socket re-establishes itself.
    fn reconnect(&self) {}

    async fn confirm_subscriptions(&self, channels: &[String]) -> ConfirmResult {
        let table = lock(&self.channels);
        let trouble = channels
            .iter()
            .filter(|channel| {
                !matches!(
                    table.get(channel.as_str()),
                    Some(ChannelState::Acknowledged | ChannelState::Requested)
                )
            })
            .cloned()
            .collect();
        ConfirmResult::Specific(trouble)
    }

    async fn fetch_history(&self, request: HistoryRequest) -> Result<HistoryOutput, HistoryError> {
        SocketClusterHistory::new(self, self.clock.as_ref())
            .fetch(&request)
            .await
    }

    fn disconnect(&self) {
        self.command(SocketCommand::Shutdown);
    }
}

impl Drop for SocketClusterConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct Session {
    ws: WsStream,
    next_cid: u64,
}

fn tls_connector(strict_ssl: bool) -> Result<Connector, TransportError> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(!strict_ssl)
        .build()?;
    Ok(Connector::NativeTls(connector))
}

/// Connects, performs the `#handshake` and invokes `auth`.
async fn open_session(settings: &SocketClusterSettings) -> Result<Session, TransportError> {
    let connector = tls_connector(settings.strict_ssl)?;
    let (mut ws, _) = tokio_tungstenite::connect_async_tls_with_config(
        settings.url.as_str(),
        None,
        false,
        Some(connector),
    )
    .await?;

    ws.send(Message::Text(protocol::handshake(1).into())).await?;
    if let Some(error) = await_reply(&mut ws, 1).await? {
        return Err(TransportError::WebSocket(format!("handshake refused: {}", error)));
    }

    let auth = protocol::auth(settings.auth_key.expose_secret(), &settings.user_id, 2);
    ws.send(Message::Text(auth.into())).await?;
    if let Some(error) = await_reply(&mut ws, 2).await? {
        return Err(TransportError::AuthRejected(error));
    }

    Ok(Session { ws, next_cid: 3 })
}

/// Reads until the reply to `rid`, returning its error if any.
async fn await_reply(ws: &mut WsStream, rid: u64) -> Result<Option<String>, TransportError> {
    while let Some(frame) = ws.next().await {
        let Message::Text(text) = frame? else {
            continue;
        };
        match protocol::parse_frame(text.as_str())? {
            IncomingFrame::Reply { rid: got, error, .. } if got == rid => return Ok(error),
            IncomingFrame::Ping => ws.send(Message::Text(String::new().into())).await?,
            IncomingFrame::PingV1 => ws.send(Message::Text(protocol::PONG_V1.to_string().into())).await?,
            other => log::debug!("Ignoring frame while waiting for reply {}: {:?}", rid, other),
        }
    }
    Err(TransportError::Closed)
}

enum Step {
    Command(Option<SocketCommand>),
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
}

struct SocketTask {
    settings: SocketClusterSettings,
    clock: Arc<dyn Clock>,
    channels: ChannelTable,
    replies: PendingReplies,
    events: TransportEventSender,
    commands: mpsc::UnboundedReceiver<SocketCommand>,
    retry: RetryPolicy,
    next_cid: u64,
    /// `#subscribe` call ids awaiting their ack.
    in_flight: HashMap<u64, String>,
}

impl SocketTask {
    async fn run(mut self, ws: WsStream) {
        let mut socket = Some(ws);

        loop {
            if socket.is_none() {
                let Some(session) = self.reestablish().await else {
                    break;
                };
                self.next_cid = session.next_cid;
                socket = Some(session.ws);
                if self.resubscribe_all(socket.as_mut()).await {
                    send_status(&self.events, TransportStatus::NetworkProblem);
                } else {
                    self.connection_lost(&mut socket, "resubscribe failed");
                }
                continue;
            }
            let Some(ws) = socket.as_mut() else {
                continue;
            };

            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                frame = ws.next() => Step::Frame(frame),
            };

            let outcome = match step {
                Step::Command(None | Some(SocketCommand::Shutdown)) => {
                    self.shutdown(ws).await;
                    break;
                }
                Step::Command(Some(command)) => self.apply(ws, command).await,
                Step::Frame(Some(Ok(Message::Text(text)))) => self.handle_text(ws, text.as_str()).await,
                Step::Frame(Some(Ok(Message::Close(_)))) | Step::Frame(None) => {
                    Err(TransportError::Closed)
                }
                Step::Frame(Some(Ok(_))) => Ok(()),
                Step::Frame(Some(Err(e))) => Err(e.into()),
            };

            if let Err(e) = outcome {
                self.connection_lost(&mut socket, &e.to_string());
            }
        }

        log::debug!("SocketCluster task stopped");
    }

    async fn apply(&mut self, ws: &mut WsStream, command: SocketCommand) -> Result<(), TransportError> {
        match command {
            SocketCommand::Subscribe(channels) => {
                for channel in channels {
                    self.send_subscribe(ws, channel).await?;
                }
            }
            SocketCommand::Unsubscribe(channels) => {
                for channel in channels {
                    self.in_flight.retain(|_, pending| *pending != channel);
                    ws.send(Message::Text(protocol::unsubscribe(&channel).into())).await?;
                }
            }
            SocketCommand::Emit { frame, .. } => ws.send(Message::Text(frame.into())).await?,
            SocketCommand::Shutdown => {}
        }
        Ok(())
    }

    async fn send_subscribe(&mut self, ws: &mut WsStream, channel: String) -> Result<(), TransportError> {
        let cid = self.next_cid;
        self.next_cid += 1;
        ws.send(Message::Text(protocol::subscribe(&channel, cid).into())).await?;
        self.in_flight.insert(cid, channel);
        Ok(())
    }

    async fn handle_text(&mut self, ws: &mut WsStream, text: &str) -> Result<(), TransportError> {
        let frame = match protocol::parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Unreadable SocketCluster frame: {}", e);
                return Ok(());
            }
        };

        match frame {
            IncomingFrame::Ping => ws.send(Message::Text(String::new().into())).await?,
            IncomingFrame::PingV1 => ws.send(Message::Text(protocol::PONG_V1.to_string().into())).await?,
            IncomingFrame::Reply { rid, error, .. } => {
                if let Some(channel) = self.in_flight.remove(&rid) {
                    self.subscription_settled(channel, error);
                }
            }
            IncomingFrame::Publish { channel, data } => {
                if lock(&self.channels).contains_key(&channel) {
                    send_message(&self.events, self.clock.now_ms(), data);
                }
            }
            IncomingFrame::History(reply) => {
                match lock(&self.replies).remove(&reply.request_id) {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => log::debug!("Dropping history reply {}", reply.request_id),
                }
            }
            IncomingFrame::KickOut { channel } => {
                log::warn!("SocketCluster kicked us out of {}", channel);
                if let Some(state) = lock(&self.channels).get_mut(&channel) {
                    *state = ChannelState::Failed;
                }
                send_status(&self.events, TransportStatus::Failed(vec![channel]));
            }
            IncomingFrame::Event { event, .. } => log::debug!("Ignoring SocketCluster event {}", event),
        }
        Ok(())
    }

    fn subscription_settled(&self, channel: String, error: Option<String>) {
        let mut table = lock(&self.channels);
        let Some(state) = table.get_mut(&channel) else {
            return;
        };
        match error {
            None => {
                *state = ChannelState::Acknowledged;
                drop(table);
                send_status(&self.events, TransportStatus::Connected(vec![channel]));
            }
            Some(error) => {
                log::warn!("SocketCluster refused subscription to {}: {}", channel, error);
                *state = ChannelState::Failed;
                drop(table);
                send_status(&self.events, TransportStatus::Failed(vec![channel]));
            }
        }
    }

    fn connection_lost(&mut self, socket: &mut Option<WsStream>, reason: &str) {
        log::warn!("SocketCluster connection lost: {}", reason);
        *socket = None;
        self.in_flight.clear();
        // waiters see a closed channel
        lock(&self.replies).clear();
        send_status(&self.events, TransportStatus::Offline);
    }

    /// Reconnects with backoff. Returns `None` on shutdown.
    async fn reestablish(&mut self) -> Option<Session> {
        let mut attempt = 0;
        loop {
            let delay = self.retry.delay_for_attempt(attempt);
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);

            loop {
                let command = tokio::select! {
                    _ = &mut sleep => break,
                    command = self.commands.recv() => command,
                };
                match command {
                    None | Some(SocketCommand::Shutdown) => return None,
                    Some(SocketCommand::Emit { request_id, .. }) => {
                        lock(&self.replies).remove(&request_id);
                    }
                    // the table already reflects these; resubscribe_all picks them up
                    Some(SocketCommand::Subscribe(_) | SocketCommand::Unsubscribe(_)) => {}
                }
            }

            match tokio::time::timeout(CONNECT_TIMEOUT, open_session(&self.settings)).await {
                Ok(Ok(session)) => {
                    log::info!("SocketCluster reconnected after {} attempts", attempt + 1);
                    return Some(session);
                }
                Ok(Err(e)) => log::warn!("SocketCluster reconnect failed: {}", e),
                Err(_) => log::warn!("SocketCluster reconnect timed out"),
            }
            attempt = attempt.saturating_add(1);
        }
    }

    async fn resubscribe_all(&mut self, socket: Option<&mut WsStream>) -> bool {
        let Some(ws) = socket else {
            return false;
        };
        let channels: Vec<String> = {
            let mut table = lock(&self.channels);
            for state in table.values_mut() {
                *state = ChannelState::Requested;
            }
            table.keys().cloned().collect()
        };
        for channel in channels {
            if let Err(e) = self.send_subscribe(ws, channel).await {
                log::warn!("SocketCluster resubscribe failed: {}", e);
                return false;
            }
        }
        true
    }

    async fn shutdown(&mut self, ws: &mut WsStream) {
        let channels: Vec<String> = lock(&self.channels).drain().map(|(channel, _)| channel).collect();
        for channel in channels {
            if ws.send(Message::Text(protocol::unsubscribe(&channel).into())).await.is_err() {
                break;
            }
        }
        let _ = ws.close(None).await;
    }
}
