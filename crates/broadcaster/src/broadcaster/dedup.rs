use std::collections::HashMap;

/// How long a message id is remembered.
pub const DEDUP_WINDOW_MS: i64 = 10 * 60 * 1000;

/// Message ids seen recently, with the local time they were first seen.
#[derive(Debug, Default)]
pub struct MessageDedupCache {
    seen: HashMap<String, i64>,
}

impl MessageDedupCache {
    /// Records `message_id`. Returns false if it was already present.
    pub fn record(&mut self, message_id: &str, now_ms: i64) -> bool {
        if self.seen.contains_key(message_id) {
            return false;
        }
        self.seen.insert(message_id.to_string(), now_ms);
        true
    }

    /// Forgets ids first seen before the window.
    pub fn purge(&mut self, now_ms: i64) {
        let cutoff = now_ms - DEDUP_WINDOW_MS;
        self.seen.retain(|_, seen_at| *seen_at >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rejected_within_window() {
        let mut cache = MessageDedupCache::default();
        assert!(cache.record("m1", 1_000));
        assert!(!cache.record("m1", 2_000));
        assert!(cache.record("m2", 2_000));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_purge_forgets_old_ids() {
        let mut cache = MessageDedupCache::default();
        cache.record("old", 0);
        cache.record("recent", DEDUP_WINDOW_MS);

        cache.purge(DEDUP_WINDOW_MS + 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.record("old", DEDUP_WINDOW_MS + 1));
        assert!(!cache.record("recent", DEDUP_WINDOW_MS + 1));
    }
}
