//! Where catch-up starts, and when it is not worth trying.

use std::time::Duration;

/// Re-read this much before the last received message.
pub const CHECKPOINT_BUFFER_MS: i64 = 12_000;
/// A fresh session also picks up messages published this long before it started.
pub const FRESH_SESSION_LOOKBACK_MS: i64 = 10_000;
/// Margin kept from the edge of the backend's retention window.
pub const RETENTION_MARGIN_MS: i64 = 10 * 60 * 1000;

/// Start of the history query.
///
/// `last_message_received_at` is 0 when nothing has been received yet.
pub fn catch_up_since(last_message_received_at: i64, initialization_started_at: i64) -> i64 {
    if last_message_received_at > 0 {
        last_message_received_at - CHECKPOINT_BUFFER_MS
    } else {
        initialization_started_at - FRESH_SESSION_LOOKBACK_MS
    }
}

/// True when `since` is too close to (or past) the retention edge to replay.
pub fn exceeds_retention(now_ms: i64, since: i64, retention: Duration) -> bool {
    let retention_ms = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
    now_ms - since > retention_ms.saturating_sub(RETENTION_MARGIN_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DEFAULT_RETENTION;

    const NOW: i64 = 1_700_000_000_000;
    const MONTH_MS: i64 = 30 * 24 * 60 * 60 * 1000;

    #[test]
    fn test_since_uses_checkpoint_with_buffer() {
        assert_eq!(catch_up_since(NOW, NOW - 5_000), NOW - 12_000);
    }

    #[test]
    fn test_since_on_fresh_session() {
        assert_eq!(catch_up_since(0, NOW), NOW - 10_000);
    }

    #[test]
    fn test_retention_threshold() {
        let edge = MONTH_MS - RETENTION_MARGIN_MS;
        assert!(!exceeds_retention(NOW, NOW - edge, DEFAULT_RETENTION));
        assert!(exceeds_retention(NOW, NOW - edge - 1, DEFAULT_RETENTION));
        assert!(!exceeds_retention(NOW, NOW - 60_000, DEFAULT_RETENTION));
    }
}
