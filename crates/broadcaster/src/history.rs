//! Shared pieces of the history fetchers.
//!
//! Each transport has its own fetcher (see `transport::pubnub::history` and
//! `transport::socketcluster::history`); both page through the backend with
//! the same bounds and return a [`HistoryOutput`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Number of follow-up pages fetched for one channel (or one slice) before
/// giving up and asking the caller to reset.
pub const MAX_PAGE_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub channels: Vec<String>,
    /// Fetch messages published after this time, epoch milliseconds.
    pub since: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryMessage {
    /// Publish time, epoch milliseconds.
    pub timestamp: i64,
    pub message: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryOutput {
    /// Retrieved messages, ascending by timestamp.
    pub messages: Vec<HistoryMessage>,
    /// Timestamp of the newest retrieved message.
    pub timestamp: Option<i64>,
    /// Too much history: the caller must re-bootstrap instead of replaying.
    pub reset: bool,
}

impl HistoryOutput {
    pub fn reset() -> Self {
        Self {
            reset: true,
            ..Default::default()
        }
    }

    /// Sorts collected messages and records the newest timestamp as checkpoint.
    pub fn from_messages(mut messages: Vec<HistoryMessage>) -> Self {
        messages.sort_by_key(|m| m.timestamp);
        let timestamp = messages.last().map(|m| m.timestamp);
        Self {
            messages,
            timestamp,
            reset: false,
        }
    }
}

/// Outcome of paging through one channel or slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingOutcome {
    Complete,
    /// Stopped early because page timestamps are ahead of the local clock.
    ClockSkew,
    /// Page limit exceeded.
    Reset,
}

/// Splits `channels` into consecutive slices of at most `size` channels.
pub fn channel_slices(channels: &[String], size: usize) -> impl Iterator<Item = &[String]> {
    channels.chunks(size.max(1))
}

/// True when a page starts in the future relative to the local clock.
///
/// Paging further would run away on a misconfigured client clock.
pub fn is_clock_skewed(page_start_ms: i64, now_ms: i64) -> bool {
    page_start_ms > now_ms
}
