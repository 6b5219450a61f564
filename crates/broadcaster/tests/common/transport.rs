//! Scripted in-memory transport.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use broadcaster::{
    ConfirmResult, HistoryError, HistoryOutput, HistoryRequest, SubscribeOptions, Transport,
    TransportEvent, TransportEventSender, TransportMessage, TransportStatus,
};

/// What the transport reports after a `subscribe` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeBehavior {
    /// `Connected(channels)` straight away.
    Connect,
    /// `Failed(channels)` straight away.
    Fail,
    /// Nothing; the test injects statuses itself.
    Silent,
}

#[derive(Default)]
struct Calls {
    subscribes: Vec<Vec<String>>,
    unsubscribes: Vec<Vec<String>>,
    confirms: Vec<Vec<String>>,
    fetches: Vec<HistoryRequest>,
    reconnects: usize,
    disconnects: usize,
}

pub struct MockTransport {
    events: TransportEventSender,
    behavior: Mutex<SubscribeBehavior>,
    confirm_results: Mutex<VecDeque<ConfirmResult>>,
    history_results: Mutex<VecDeque<Result<HistoryOutput, HistoryError>>>,
    retention: Duration,
    calls: Mutex<Calls>,
    fetch_gate: Mutex<Option<oneshot::Receiver<()>>>,
    confirm_gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl MockTransport {
    pub fn new(events: TransportEventSender) -> Self {
        Self {
            events,
            behavior: Mutex::new(SubscribeBehavior::Connect),
            confirm_results: Mutex::new(VecDeque::new()),
            history_results: Mutex::new(VecDeque::new()),
            retention: broadcaster::transport::DEFAULT_RETENTION,
            calls: Mutex::new(Calls::default()),
            fetch_gate: Mutex::new(None),
            confirm_gate: Mutex::new(None),
        }
    }

    /// Holds the next history fetch open until the returned sender fires
    /// (or is dropped).
    pub fn hold_next_fetch(&self) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        *self.fetch_gate.lock().unwrap() = Some(gate);
        release
    }

    /// Holds the next confirm open until the returned sender fires.
    pub fn hold_next_confirm(&self) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        *self.confirm_gate.lock().unwrap() = Some(gate);
        release
    }

    pub fn set_behavior(&self, behavior: SubscribeBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Queues the result of the next confirm. Unscripted confirms report
    /// `AllConfirmed`.
    pub fn push_confirm(&self, result: ConfirmResult) {
        self.confirm_results.lock().unwrap().push_back(result);
    }

    /// Queues the result of the next history fetch. Unscripted fetches
    /// return no messages.
    pub fn push_history(&self, result: Result<HistoryOutput, HistoryError>) {
        self.history_results.lock().unwrap().push_back(result);
    }

    pub fn emit_status(&self, status: TransportStatus) {
        self.events.send(TransportEvent::Status(status)).unwrap();
    }

    pub fn emit_message(&self, received_at: i64, message: Value) {
        self.events
            .send(TransportEvent::Message(TransportMessage {
                received_at,
                message,
            }))
            .unwrap();
    }

    pub fn subscribes(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().subscribes.clone()
    }

    pub fn unsubscribes(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().unsubscribes.clone()
    }

    pub fn confirms(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().confirms.clone()
    }

    pub fn fetches(&self) -> Vec<HistoryRequest> {
        self.calls.lock().unwrap().fetches.clone()
    }

    pub fn reconnects(&self) -> usize {
        self.calls.lock().unwrap().reconnects
    }

    pub fn disconnects(&self) -> usize {
        self.calls.lock().unwrap().disconnects
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn subscribe(&self, channels: &[String], _options: &SubscribeOptions) {
        self.calls.lock().unwrap().subscribes.push(channels.to_vec());
        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            SubscribeBehavior::Connect => {
                self.emit_status(TransportStatus::Connected(channels.to_vec()))
            }
            SubscribeBehavior::Fail => self.emit_status(TransportStatus::Failed(channels.to_vec())),
            SubscribeBehavior::Silent => {}
        }
    }

    fn unsubscribe(&self, channels: &[String]) {
        self.calls.lock().unwrap().unsubscribes.push(channels.to_vec());
    }

    fn reconnect(&self) {
        self.calls.lock().unwrap().reconnects += 1;
    }

    async fn confirm_subscriptions(&self, channels: &[String]) -> ConfirmResult {
        self.calls.lock().unwrap().confirms.push(channels.to_vec());
        let gate = self.confirm_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.confirm_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ConfirmResult::AllConfirmed)
    }

    async fn fetch_history(&self, request: HistoryRequest) -> Result<HistoryOutput, HistoryError> {
        self.calls.lock().unwrap().fetches.push(request);
        let gate = self.fetch_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.history_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(HistoryOutput::default()))
    }

    fn disconnect(&self) {
        self.calls.lock().unwrap().disconnects += 1;
    }

    fn retention(&self) -> Duration {
        self.retention
    }
}
