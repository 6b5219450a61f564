use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use serde_json::Value;

use crate::clock::Clock;
use crate::error::HistoryError;
use crate::history::{
    channel_slices, is_clock_skewed, HistoryMessage, HistoryOutput, HistoryRequest, PagingOutcome,
    MAX_PAGE_DEPTH,
};

use super::rest::{timestamp_to_timetoken, timetoken_to_timestamp};

/// Channels per batch history request.
pub const BATCH_CHANNEL_LIMIT: usize = 500;
/// Messages per channel returned by a batch request.
pub const BATCH_PAGE_SIZE: usize = 25;
/// Messages per single-channel history page.
pub const CHANNEL_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct PubnubHistoryItem {
    pub timetoken: u64,
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelHistoryPage {
    pub messages: Vec<PubnubHistoryItem>,
    /// Timetoken of the oldest message in the page.
    pub start_timetoken: u64,
}

/// The two PubNub history endpoints the fetcher pages through.
#[async_trait]
pub trait PubnubHistoryApi: Send + Sync {
    /// Newest `max` messages per channel published after `end`.
    async fn fetch_messages(
        &self,
        channels: &[String],
        end: u64,
        max: usize,
    ) -> Result<HashMap<String, Vec<PubnubHistoryItem>>, HistoryError>;

    /// Up to `count` messages of `channel` published before `start` and after `end`.
    async fn channel_history(
        &self,
        channel: &str,
        start: u64,
        end: u64,
        count: usize,
    ) -> Result<ChannelHistoryPage, HistoryError>;
}

pub struct PubnubHistory<'a, A: ?Sized> {
    api: &'a A,
    clock: &'a dyn Clock,
}

impl<'a, A: PubnubHistoryApi + ?Sized> PubnubHistory<'a, A> {
    pub fn new(api: &'a A, clock: &'a dyn Clock) -> Self {
        Self { api, clock }
    }

    pub async fn fetch(&self, request: &HistoryRequest) -> Result<HistoryOutput, HistoryError> {
        let since = timestamp_to_timetoken(request.since);
        let mut collected = Vec::new();

        for slice in channel_slices(&request.channels, BATCH_CHANNEL_LIMIT) {
            if self.fetch_slice(slice, since, &mut collected).await? == PagingOutcome::Reset {
                log::info!(
                    "History for {} channels exceeds {} pages, requesting reset",
                    slice.len(),
                    MAX_PAGE_DEPTH
                );
                return Ok(HistoryOutput::reset());
            }
        }

        log::debug!(
            "Fetched {} missed messages for {} channels",
            collected.len(),
            request.channels.len()
        );
        Ok(HistoryOutput::from_messages(collected))
    }

    async fn fetch_slice(
        &self,
        channels: &[String],
        since: u64,
        collected: &mut Vec<HistoryMessage>,
    ) -> Result<PagingOutcome, HistoryError> {
        let batch = self.api.fetch_messages(channels, since, BATCH_PAGE_SIZE).await?;

        let mut truncated = Vec::new();
        for (channel, items) in batch {
            if items.len() >= BATCH_PAGE_SIZE {
                if let Some(earliest) = items.iter().map(|item| item.timetoken).min() {
                    truncated.push((channel, earliest));
                }
            }
            collected.extend(items.into_iter().map(into_history_message));
        }

        if truncated.is_empty() {
            return Ok(PagingOutcome::Complete);
        }

        let pages = try_join_all(
            truncated
                .iter()
                .map(|(channel, earliest)| self.page_channel(channel, earliest.saturating_sub(1), since)),
        )
        .await?;

        let mut outcome = PagingOutcome::Complete;
        for (channel_outcome, messages) in pages {
            collected.extend(messages);
            if channel_outcome == PagingOutcome::Reset {
                outcome = PagingOutcome::Reset;
            }
        }
        Ok(outcome)
    }

    /// Walks one channel backwards from `before` until a short page.
    async fn page_channel(
        &self,
        channel: &str,
        mut before: u64,
        since: u64,
    ) -> Result<(PagingOutcome, Vec<HistoryMessage>), HistoryError> {
        let mut messages = Vec::new();
        let mut depth = 0;

        loop {
            if depth == MAX_PAGE_DEPTH {
                return Ok((PagingOutcome::Reset, messages));
            }
            depth += 1;

            let page = self
                .api
                .channel_history(channel, before, since, CHANNEL_PAGE_SIZE)
                .await?;
            let full = page.messages.len() >= CHANNEL_PAGE_SIZE;
            messages.extend(page.messages.into_iter().map(into_history_message));

            if !full {
                return Ok((PagingOutcome::Complete, messages));
            }

            let page_start = timetoken_to_timestamp(page.start_timetoken);
            if is_clock_skewed(page_start, self.clock.now_ms()) {
                log::warn!(
                    "History page for {} starts at {} which is ahead of the local clock, stopping",
                    channel,
                    page_start
                );
                return Ok((PagingOutcome::ClockSkew, messages));
            }
            before = page.start_timetoken;
        }
    }
}

fn into_history_message(item: PubnubHistoryItem) -> HistoryMessage {
    HistoryMessage {
        timestamp: timetoken_to_timestamp(item.timetoken),
        message: item.message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const NOW: i64 = 1_700_000_000_000;

    struct FixedClock(i64);

    impl Clock for FixedClock {
        fn now_ms(&self) -> i64 {
            self.0
        }
    }

    /// Serves fixed batch sizes per channel, and pages whose start moves back a second per call.
    struct ScriptedApi {
        batch: HashMap<String, usize>,
        page_size: usize,
        page_start_ms: i64,
        batch_calls: Mutex<Vec<usize>>,
        page_calls: AtomicUsize,
    }

    impl ScriptedApi {
        fn new(batch: &[(&str, usize)], page_size: usize) -> Self {
            Self {
                batch: batch.iter().map(|(c, n)| (c.to_string(), *n)).collect(),
                page_size,
                page_start_ms: NOW - 60_000,
                batch_calls: Mutex::new(Vec::new()),
                page_calls: AtomicUsize::new(0),
            }
        }
    }

    fn item(ms: i64, n: usize) -> PubnubHistoryItem {
        PubnubHistoryItem {
            timetoken: timestamp_to_timetoken(ms),
            message: json!({ "messageId": format!("m{}-{}", ms, n) }),
        }
    }

    #[async_trait]
    impl PubnubHistoryApi for ScriptedApi {
        async fn fetch_messages(
            &self,
            channels: &[String],
            _end: u64,
            max: usize,
        ) -> Result<HashMap<String, Vec<PubnubHistoryItem>>, HistoryError> {
            self.batch_calls.lock().unwrap().push(channels.len());
            Ok(channels
                .iter()
                .filter_map(|c| self.batch.get(c).map(|n| (c.clone(), *n)))
                .map(|(c, n)| {
                    let items = (0..n.min(max)).map(|i| item(NOW - 1_000 + i as i64, i)).collect();
                    (c, items)
                })
                .collect())
        }

        async fn channel_history(
            &self,
            _channel: &str,
            _start: u64,
            _end: u64,
            count: usize,
        ) -> Result<ChannelHistoryPage, HistoryError> {
            let call = self.page_calls.fetch_add(1, Ordering::SeqCst) as i64;
            let start = self.page_start_ms - call * 1_000;
            let messages = (0..self.page_size.min(count)).map(|i| item(start, i)).collect();
            Ok(ChannelHistoryPage {
                messages,
                start_timetoken: timestamp_to_timetoken(start),
            })
        }
    }

    fn request(channels: &[&str]) -> HistoryRequest {
        HistoryRequest {
            channels: channels.iter().map(|c| c.to_string()).collect(),
            since: NOW - 3_600_000,
        }
    }

    #[tokio::test]
    async fn test_short_batch_needs_no_paging() {
        let api = ScriptedApi::new(&[("team-5", 3), ("user-9", 2)], CHANNEL_PAGE_SIZE);
        let clock = FixedClock(NOW);
        let output = PubnubHistory::new(&api, &clock)
            .fetch(&request(&["team-5", "user-9"]))
            .await
            .unwrap();

        assert!(!output.reset);
        assert_eq!(output.messages.len(), 5);
        assert_eq!(output.timestamp, Some(NOW - 1_000 + 2));
        assert_eq!(api.page_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_capped_channel_is_paged_until_short_page() {
        let api = ScriptedApi::new(&[("team-5", BATCH_PAGE_SIZE)], 40);
        let clock = FixedClock(NOW);
        let output = PubnubHistory::new(&api, &clock)
            .fetch(&request(&["team-5"]))
            .await
            .unwrap();

        assert!(!output.reset);
        assert_eq!(api.page_calls.load(Ordering::SeqCst), 1);
        assert_eq!(output.messages.len(), BATCH_PAGE_SIZE + 40);
        assert!(output
            .messages
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_too_many_pages_requests_reset() {
        let api = ScriptedApi::new(&[("team-5", BATCH_PAGE_SIZE)], CHANNEL_PAGE_SIZE);
        let clock = FixedClock(NOW);
        let output = PubnubHistory::new(&api, &clock)
            .fetch(&request(&["team-5"]))
            .await
            .unwrap();

        assert!(output.reset);
        assert!(output.messages.is_empty());
        assert_eq!(api.page_calls.load(Ordering::SeqCst), MAX_PAGE_DEPTH);
    }

    #[tokio::test]
    async fn test_future_page_stops_paging() {
        let mut api = ScriptedApi::new(&[("team-5", BATCH_PAGE_SIZE)], CHANNEL_PAGE_SIZE);
        api.page_start_ms = NOW + 3_600_000;
        let clock = FixedClock(NOW);
        let output = PubnubHistory::new(&api, &clock)
            .fetch(&request(&["team-5"]))
            .await
            .unwrap();

        assert!(!output.reset);
        assert_eq!(api.page_calls.load(Ordering::SeqCst), 1);
        assert_eq!(output.messages.len(), BATCH_PAGE_SIZE + CHANNEL_PAGE_SIZE);
    }

    #[tokio::test]
    async fn test_channels_are_requested_in_slices() {
        let channels: Vec<String> = (0..1_200).map(|i| format!("stream-{}", i)).collect();
        let api = ScriptedApi::new(&[], CHANNEL_PAGE_SIZE);
        let clock = FixedClock(NOW);
        let output = PubnubHistory::new(&api, &clock)
            .fetch(&HistoryRequest {
                channels,
                since: NOW - 1_000,
            })
            .await
            .unwrap();

        assert!(output.messages.is_empty());
        assert_eq!(output.timestamp, None);
        assert_eq!(*api.batch_calls.lock().unwrap(), vec![500, 500, 200]);
    }
}
