use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::HistoryError;
use crate::history::{
    channel_slices, is_clock_skewed, HistoryMessage, HistoryOutput, HistoryRequest, PagingOutcome,
    MAX_PAGE_DEPTH,
};

use super::protocol::{HistoryQuery, HistoryReply};

/// Channels per `getHistory` request.
pub const SLICE_SIZE: usize = 100;
/// A reply this long means more history is waiting.
pub const PAGE_SIZE: usize = 100;
pub const PAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Request/reply over the socket's `getHistory`/`history` events.
#[async_trait]
pub trait HistoryRpc: Send + Sync {
    async fn request_history(&self, query: HistoryQuery) -> Result<HistoryReply, HistoryError>;
}

pub struct SocketClusterHistory<'a, R: ?Sized> {
    rpc: &'a R,
    clock: &'a dyn Clock,
}

impl<'a, R: HistoryRpc + ?Sized> SocketClusterHistory<'a, R> {
    pub fn new(rpc: &'a R, clock: &'a dyn Clock) -> Self {
        Self { rpc, clock }
    }

    pub async fn fetch(&self, request: &HistoryRequest) -> Result<HistoryOutput, HistoryError> {
        let mut collected = Vec::new();

        for slice in channel_slices(&request.channels, SLICE_SIZE) {
            if self.fetch_slice(slice, request.since, &mut collected).await? == PagingOutcome::Reset {
                log::info!(
                    "History for {} channels exceeds {} pages, requesting reset",
                    slice.len(),
                    MAX_PAGE_DEPTH
                );
                return Ok(HistoryOutput::reset());
            }
        }

        Ok(HistoryOutput::from_messages(collected))
    }

    /// Pages one slice forward in time, each page starting at the last timestamp seen.
    async fn fetch_slice(
        &self,
        channels: &[String],
        mut since: i64,
        collected: &mut Vec<HistoryMessage>,
    ) -> Result<PagingOutcome, HistoryError> {
        let mut depth = 0;

        loop {
            if depth == MAX_PAGE_DEPTH {
                return Ok(PagingOutcome::Reset);
            }
            depth += 1;

            let query = HistoryQuery {
                request_id: Uuid::new_v4().to_string(),
                channels: channels.to_vec(),
                since,
            };
            let reply = tokio::time::timeout(PAGE_TIMEOUT, self.rpc.request_history(query))
                .await
                .map_err(|_| HistoryError::Timeout(PAGE_TIMEOUT.as_millis() as u64))??;

            if let Some(error) = reply.error {
                return Err(HistoryError::Rejected(error));
            }

            let full = reply.messages.len() >= PAGE_SIZE;
            let last = reply.messages.last().map(|m| m.timestamp);
            collected.extend(reply.messages);

            let Some(last) = last.filter(|_| full) else {
                return Ok(PagingOutcome::Complete);
            };
            if is_clock_skewed(last, self.clock.now_ms()) {
                log::warn!(
                    "History page ends at {} which is ahead of the local clock, stopping",
                    last
                );
                return Ok(PagingOutcome::ClockSkew);
            }
            since = last;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    const NOW: i64 = 1_700_000_000_000;

    struct FixedClock;

    impl Clock for FixedClock {
        fn now_ms(&self) -> i64 {
            NOW
        }
    }

    enum Script {
        /// Every reply carries this many messages, continuing from `since`.
        Pages(usize),
        Error(&'static str),
        Silent,
    }

    struct ScriptedRpc {
        script: Script,
        queries: Mutex<Vec<HistoryQuery>>,
    }

    impl ScriptedRpc {
        fn new(script: Script) -> Self {
            Self {
                script,
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HistoryRpc for ScriptedRpc {
        async fn request_history(&self, query: HistoryQuery) -> Result<HistoryReply, HistoryError> {
            self.queries.lock().unwrap().push(query.clone());
            let messages = match self.script {
                Script::Pages(count) => (1..=count as i64)
                    .map(|i| HistoryMessage {
                        timestamp: query.since + i,
                        message: json!({ "messageId": format!("m{}", query.since + i) }),
                    })
                    .collect(),
                Script::Error(error) => {
                    return Ok(HistoryReply {
                        request_id: query.request_id,
                        messages: vec![],
                        channels: query.channels,
                        error: Some(error.to_string()),
                    })
                }
                Script::Silent => std::future::pending().await,
            };
            Ok(HistoryReply {
                request_id: query.request_id,
                messages,
                channels: query.channels,
                error: None,
            })
        }
    }

    fn request(count: usize) -> HistoryRequest {
        HistoryRequest {
            channels: (0..count).map(|i| format!("stream-{}", i)).collect(),
            since: NOW - 60_000,
        }
    }

    #[tokio::test]
    async fn test_short_page_completes() {
        let rpc = ScriptedRpc::new(Script::Pages(3));
        let output = SocketClusterHistory::new(&rpc, &FixedClock)
            .fetch(&request(2))
            .await
            .unwrap();

        assert!(!output.reset);
        assert_eq!(output.messages.len(), 3);
        assert_eq!(output.timestamp, Some(NOW - 60_000 + 3));
        assert_eq!(rpc.queries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_page_continues_from_last_timestamp() {
        let rpc = ScriptedRpc::new(Script::Pages(PAGE_SIZE));
        let output = SocketClusterHistory::new(&rpc, &FixedClock)
            .fetch(&request(1))
            .await
            .unwrap();

        assert!(output.reset);
        let queries = rpc.queries.lock().unwrap();
        assert_eq!(queries.len(), MAX_PAGE_DEPTH);
        assert_eq!(queries[1].since, NOW - 60_000 + PAGE_SIZE as i64);
        assert_ne!(queries[0].request_id, queries[1].request_id);
    }

    #[tokio::test]
    async fn test_channels_are_sliced() {
        let rpc = ScriptedRpc::new(Script::Pages(0));
        SocketClusterHistory::new(&rpc, &FixedClock)
            .fetch(&request(250))
            .await
            .unwrap();

        let sizes: Vec<usize> = rpc.queries.lock().unwrap().iter().map(|q| q.channels.len()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[tokio::test]
    async fn test_reply_error_is_history_error() {
        let rpc = ScriptedRpc::new(Script::Error("not authorized"));
        let result = SocketClusterHistory::new(&rpc, &FixedClock).fetch(&request(1)).await;
        assert!(matches!(result, Err(HistoryError::Rejected(msg)) if msg == "not authorized"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_reply_times_out() {
        let rpc = ScriptedRpc::new(Script::Silent);
        let result = SocketClusterHistory::new(&rpc, &FixedClock).fetch(&request(1)).await;
        assert!(matches!(result, Err(HistoryError::Timeout(5000))));
    }
}
