//! A started broadcaster over a [`MockTransport`], plus helpers for awaiting
//! its output.

#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::broadcast::Receiver;
use tokio::time::Instant;

use broadcaster::{
    event_channel, Broadcaster, BroadcasterOptions, BroadcasterStatus, BroadcasterStatusType, Clock,
    MessageEvent,
};

use super::transport::MockTransport;

/// Wall-clock time at which every test starts.
pub const START_MS: i64 = 1_700_000_000_000;

/// Epoch milliseconds that move with tokio time, so paused-time tests see
/// timers and the wall clock agree. `advance` jumps the wall clock alone.
pub struct MockClock {
    origin: Instant,
    offset: AtomicI64,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: AtomicI64::new(START_MS),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> i64 {
        self.offset.load(Ordering::SeqCst) + self.origin.elapsed().as_millis() as i64
    }
}

pub struct TestBroadcaster {
    pub broadcaster: Broadcaster,
    pub transport: Arc<MockTransport>,
    pub clock: Arc<MockClock>,
    pub statuses: Receiver<BroadcasterStatus>,
    pub messages: Receiver<Vec<MessageEvent>>,
}

impl TestBroadcaster {
    /// Test mode on, no persisted checkpoint.
    pub fn start() -> Self {
        Self::start_with(BroadcasterOptions {
            test_mode: true,
            ..Default::default()
        })
    }

    pub fn start_with(options: BroadcasterOptions) -> Self {
        let (events, event_rx) = event_channel();
        let transport = Arc::new(MockTransport::new(events));
        let clock = Arc::new(MockClock::new());
        let broadcaster = Broadcaster::start_with_clock(
            transport.clone(),
            event_rx,
            options,
            clock.clone(),
        );
        let statuses = broadcaster.status_events();
        let messages = broadcaster.messages();
        Self {
            broadcaster,
            transport,
            clock,
            statuses,
            messages,
        }
    }

    /// Subscribes and waits for the resulting `Connected`.
    pub async fn connect(&mut self, channels: &[&str]) -> BroadcasterStatus {
        self.broadcaster.subscribe(channels.iter().copied());
        let status = self.next_status().await;
        assert_eq!(status.status, BroadcasterStatusType::Connected, "{:?}", status);
        status
    }

    pub async fn next_status(&mut self) -> BroadcasterStatus {
        tokio::time::timeout(Duration::from_secs(120), self.statuses.recv())
            .await
            .expect("timed out waiting for a status")
            .expect("status stream closed")
    }

    pub async fn next_batch(&mut self) -> Vec<MessageEvent> {
        tokio::time::timeout(Duration::from_secs(120), self.messages.recv())
            .await
            .expect("timed out waiting for messages")
            .expect("message stream closed")
    }

    /// Lets every ready task run to completion.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    pub fn assert_no_status(&mut self) {
        match self.statuses.try_recv() {
            Err(TryRecvError::Empty) => {}
            other => panic!("unexpected status: {:?}", other),
        }
    }

    pub fn assert_no_messages(&mut self) {
        match self.messages.try_recv() {
            Err(TryRecvError::Empty) => {}
            other => panic!("unexpected messages: {:?}", other),
        }
    }
}

pub fn channels(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}
