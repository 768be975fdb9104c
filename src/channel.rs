//! Channel and topic membership, the fan-out half of C7.
//!
//! A channel is a named, persisted member set; a topic is a free-form,
//! unpersisted subscriber set. Both live here because they share the same
//! "ordered set of names" shape, grounded in the same insertion-ordered
//! pattern the agent registry uses for iteration determinism.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Builds the canonical `dm:A:B` channel name for a direct-message pair,
/// with participants sorted so `dm:A:B` and `dm:B:A` always collide.
#[must_use]
pub fn canonical_dm_name(a: &str, b: &str) -> String {
    if a <= b {
        format!("dm:{a}:{b}")
    } else {
        format!("dm:{b}:{a}")
    }
}

#[must_use]
pub fn is_channel_name(name: &str) -> bool {
    name.starts_with('#') || name.starts_with("dm:")
}

/// An ordered member set; iteration order is insertion order.
#[derive(Debug, Default, Clone)]
struct OrderedSet {
    order: Vec<String>,
    members: HashSet<String>,
}

impl OrderedSet {
    fn insert(&mut self, item: &str) -> bool {
        if self.members.insert(item.to_string()) {
            self.order.push(item.to_string());
            true
        } else {
            false
        }
    }

    fn remove(&mut self, item: &str) -> bool {
        if self.members.remove(item) {
            self.order.retain(|m| m != item);
            true
        } else {
            false
        }
    }

    fn contains(&self, item: &str) -> bool {
        self.members.contains(item)
    }

    fn iter(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }
}

/// Channel membership table: name → ordered member set.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, OrderedSet>>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins `agent` to `channel`, returning `true` if this changed membership.
    pub fn join(&self, channel: &str, agent: &str) -> bool {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let mut channels = self.channels.lock().unwrap();
        channels.entry(channel.to_string()).or_default().insert(agent)
    }

    /// Removes `agent` from `channel`, returning `true` if it had been a member.
    pub fn leave(&self, channel: &str, agent: &str) -> bool {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let mut channels = self.channels.lock().unwrap();
        channels
            .get_mut(channel)
            .is_some_and(|set| set.remove(agent))
    }

    #[must_use]
    pub fn is_member(&self, channel: &str, agent: &str) -> bool {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.channels
            .lock()
            .unwrap()
            .get(channel)
            .is_some_and(|set| set.contains(agent))
    }

    /// Members of `channel`, in insertion (join) order.
    #[must_use]
    pub fn members(&self, channel: &str) -> Vec<String> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.channels
            .lock()
            .unwrap()
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Restores a channel's membership wholesale, used on broker restart
    /// before any Connection is allowed to HELLO (§4.7).
    pub fn restore(&self, channel: &str, members: Vec<String>) {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        let mut channels = self.channels.lock().unwrap();
        let mut set = OrderedSet::default();
        for m in members {
            set.insert(&m);
        }
        channels.insert(channel.to_string(), set);
    }

    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.channels.lock().unwrap().keys().cloned().collect()
    }
}

/// Topic subscription table: free-form name → subscribed connection ids.
/// No persisted membership and no per-member queueing, unlike channels.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: Mutex<HashMap<String, OrderedSet>>,
}

impl TopicRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str, connection_id: &str) {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .insert(connection_id);
    }

    pub fn unsubscribe(&self, topic: &str, connection_id: &str) {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        if let Some(set) = self.topics.lock().unwrap().get_mut(topic) {
            set.remove(connection_id);
        }
    }

    #[must_use]
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        #[allow(unwrap_used, reason = "poisoned mutex means the broker is already crashing")]
        self.topics
            .lock()
            .unwrap()
            .get(topic)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_dm_name_is_order_independent() {
        assert_eq!(canonical_dm_name("alice", "bob"), "dm:alice:bob");
        assert_eq!(canonical_dm_name("bob", "alice"), "dm:alice:bob");
    }

    #[test]
    fn join_and_leave_track_membership() {
        let reg = ChannelRegistry::new();
        assert!(reg.join("#general", "alice"));
        assert!(!reg.join("#general", "alice")); // already a member
        assert!(reg.is_member("#general", "alice"));
        assert!(reg.leave("#general", "alice"));
        assert!(!reg.is_member("#general", "alice"));
    }

    #[test]
    fn members_preserve_join_order() {
        let reg = ChannelRegistry::new();
        reg.join("#general", "carol");
        reg.join("#general", "alice");
        reg.join("#general", "bob");
        assert_eq!(reg.members("#general"), vec!["carol", "alice", "bob"]);
    }

    #[test]
    fn restore_replaces_membership_wholesale() {
        let reg = ChannelRegistry::new();
        reg.join("#general", "alice");
        reg.restore("#general", vec!["bob".to_string(), "carol".to_string()]);
        assert_eq!(reg.members("#general"), vec!["bob", "carol"]);
    }

    #[test]
    fn topics_have_no_persisted_backlog_concept() {
        let topics = TopicRegistry::new();
        topics.subscribe("builds", "conn-1");
        topics.subscribe("builds", "conn-2");
        topics.unsubscribe("builds", "conn-1");
        assert_eq!(topics.subscribers("builds"), vec!["conn-2"]);
    }

    #[test]
    fn subscribe_then_unsubscribe_leaves_set_unchanged() {
        let topics = TopicRegistry::new();
        let before = topics.subscribers("builds");
        topics.subscribe("builds", "conn-1");
        topics.unsubscribe("builds", "conn-1");
        assert_eq!(topics.subscribers("builds"), before);
    }
}
