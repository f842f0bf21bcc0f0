//! Topic index mapping topic names to subscribed connections
//!
//! Owned exclusively by the registry; connections reach it only through the
//! registry's subscribe/unsubscribe notifications. A topic key exists in the
//! index if and only if its bucket is non-empty, so enumeration reflects only
//! live interest.

use crate::connection::ConnectionId;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct TopicIndex {
    buckets: HashMap<String, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

impl TopicIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a topic bucket. Returns false when it was already
    /// subscribed (set semantics).
    pub fn subscribe(&mut self, topic: &str, id: ConnectionId) -> bool {
        let inserted = self.buckets.entry(topic.to_string()).or_default().insert(id);
        if inserted {
            self.memberships.entry(id).or_default().insert(topic.to_string());
        }
        inserted
    }

    /// Remove a connection from a topic bucket, dropping the bucket when it
    /// empties. Unsubscribing a topic never joined is a no-op.
    pub fn unsubscribe(&mut self, topic: &str, id: ConnectionId) -> bool {
        let Some(bucket) = self.buckets.get_mut(topic) else {
            return false;
        };
        let removed = bucket.remove(&id);
        if bucket.is_empty() {
            self.buckets.remove(topic);
        }
        if removed {
            if let Some(topics) = self.memberships.get_mut(&id) {
                topics.remove(topic);
                if topics.is_empty() {
                    self.memberships.remove(&id);
                }
            }
        }
        removed
    }

    /// Remove a connection from every bucket it belongs to, returning the
    /// topics it left.
    pub fn purge(&mut self, id: ConnectionId) -> Vec<String> {
        let topics: Vec<String> = self
            .memberships
            .remove(&id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for topic in &topics {
            if let Some(bucket) = self.buckets.get_mut(topic) {
                bucket.remove(&id);
                if bucket.is_empty() {
                    self.buckets.remove(topic);
                }
            }
        }
        topics
    }

    /// Union of the named buckets: every connection subscribed to at least one
    /// of the requested topics.
    pub fn union(&self, topics: &[String]) -> HashSet<ConnectionId> {
        let mut ids = HashSet::new();
        for topic in topics {
            if let Some(bucket) = self.buckets.get(topic) {
                ids.extend(bucket.iter().copied());
            }
        }
        ids
    }

    pub fn members(&self, topic: &str) -> Option<&HashSet<ConnectionId>> {
        self.buckets.get(topic)
    }

    /// Topics with at least one subscriber.
    pub fn topics(&self) -> Vec<String> {
        self.buckets.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
