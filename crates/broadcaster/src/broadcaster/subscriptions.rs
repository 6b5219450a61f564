/// One requested channel and whether the transport has confirmed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSubscription {
    pub name: String,
    pub subscribed: bool,
}

/// Requested channels in request order.
#[derive(Debug, Default)]
pub struct SubscriptionMap {
    entries: Vec<ChannelSubscription>,
}

impl SubscriptionMap {
    /// Adds unknown channels as unsubscribed. Returns how many were new.
    pub fn add(&mut self, channels: &[String]) -> usize {
        let mut added = 0;
        for channel in channels {
            if !self.contains(channel) {
                self.entries.push(ChannelSubscription {
                    name: channel.clone(),
                    subscribed: false,
                });
                added += 1;
            }
        }
        added
    }

    /// Marks known channels subscribed. Returns how many of `channels` are known.
    pub fn mark_subscribed(&mut self, channels: &[String]) -> usize {
        self.set(channels, true)
    }

    pub fn mark_unsubscribed(&mut self, channels: &[String]) -> usize {
        self.set(channels, false)
    }

    fn set(&mut self, channels: &[String], subscribed: bool) -> usize {
        let mut known = 0;
        for entry in &mut self.entries {
            if channels.contains(&entry.name) {
                entry.subscribed = subscribed;
                known += 1;
            }
        }
        known
    }

    pub fn remove(&mut self, channels: &[String]) {
        self.entries.retain(|entry| !channels.contains(&entry.name));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.entries.iter().any(|entry| entry.name == channel)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn all(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.name.clone()).collect()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.filtered(true)
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.filtered(false)
    }

    fn filtered(&self, subscribed: bool) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.subscribed == subscribed)
            .map(|entry| entry.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_add_keeps_order_and_counts_new() {
        let mut map = SubscriptionMap::default();
        assert_eq!(map.add(&names(&["team-5", "user-9"])), 2);
        assert_eq!(map.add(&names(&["user-9", "stream-1"])), 1);
        assert_eq!(map.all(), names(&["team-5", "user-9", "stream-1"]));
        assert_eq!(map.unsubscribed().len(), 3);
    }

    #[test]
    fn test_mark_ignores_unknown_channels() {
        let mut map = SubscriptionMap::default();
        map.add(&names(&["team-5", "user-9"]));

        assert_eq!(map.mark_subscribed(&names(&["team-5", "stream-404"])), 1);
        assert_eq!(map.subscribed(), names(&["team-5"]));
        assert_eq!(map.unsubscribed(), names(&["user-9"]));
        assert!(!map.contains("stream-404"));

        map.mark_unsubscribed(&names(&["team-5"]));
        assert!(map.subscribed().is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let mut map = SubscriptionMap::default();
        map.add(&names(&["team-5", "user-9"]));
        map.remove(&names(&["team-5"]));
        assert_eq!(map.all(), names(&["user-9"]));
        map.clear();
        assert!(map.is_empty());
    }
}
