//! Subscription table
//!
//! Maps a message id to the ordered list of members that asked for it.
//! Delivery follows subscription order.

use std::collections::HashMap;

use crate::protocol::{MemberId, MessageId};

#[derive(Debug, Default)]
pub struct SubscriptionTable {
    table: HashMap<MessageId, Vec<MemberId>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `member` to the subscribers of `id`.
    ///
    /// Returns false if it was already subscribed; delivery is per member, so
    /// a repeated subscription changes nothing.
    pub fn subscribe(&mut self, id: MessageId, member: MemberId) -> bool {
        let subscribers = self.table.entry(id).or_default();
        if subscribers.contains(&member) {
            return false;
        }
        subscribers.push(member);
        true
    }

    /// Subscribers of `id` in subscription order
    pub fn subscribers(&self, id: MessageId) -> &[MemberId] {
        self.table.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Owned copy of the subscriber list, safe to iterate while members are removed
    pub fn snapshot(&self, id: MessageId) -> Vec<MemberId> {
        self.subscribers(id).to_vec()
    }

    pub fn is_subscribed(&self, id: MessageId, member: MemberId) -> bool {
        self.subscribers(id).contains(&member)
    }

    /// Purge `member` from every list; returns how many entries were removed
    pub fn remove_member(&mut self, member: MemberId) -> usize {
        let mut removed = 0;
        self.table.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|m| *m != member);
            removed += before - subscribers.len();
            !subscribers.is_empty()
        });
        removed
    }

    /// Number of message ids with at least one subscriber
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
