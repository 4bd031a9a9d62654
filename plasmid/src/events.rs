// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use plasmid_core::{Entry, FeedKey, SubscribeOptions};
use serde_json::Value;

/// Name under which subscription related events are published.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKey {
    Feed(FeedKey),
    Alias(String),
}

impl EventKey {
    pub fn feed_key(&self) -> Option<&FeedKey> {
        match self {
            EventKey::Feed(feed_key) => Some(feed_key),
            EventKey::Alias(_) => None,
        }
    }

    pub fn alias(&self) -> Option<&str> {
        match self {
            EventKey::Feed(_) => None,
            EventKey::Alias(alias) => Some(alias),
        }
    }
}

impl From<FeedKey> for EventKey {
    fn from(value: FeedKey) -> Self {
        EventKey::Feed(value)
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKey::Feed(feed_key) => write!(f, "{feed_key}"),
            EventKey::Alias(alias) => write!(f, "{alias}"),
        }
    }
}

/// Notifications published by a node.
///
/// Events of one feed are published in the order of that feed. Events of different feeds may
/// interleave in any order.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeEvent {
    /// The node replayed its whole feed after starting up.
    Ready,

    /// An entry was processed on the node's own feed. Published for every entry, including system
    /// entries and relayed remote content.
    AuthoredEntry(Entry),

    /// A subscription was opened, published once for the feed key and once for an alias.
    Subscribed {
        key: EventKey,
        details: Value,
        options: SubscribeOptions,
    },

    /// A subscription was closed, published once for the feed key and once per alias.
    Unsubscribed { key: EventKey },

    /// A subscribed feed received an entry not older than the subscription.
    NewData {
        key: EventKey,
        entry: Entry,
        details: Value,
    },

    /// A capability was granted to a feed.
    Grant { feed_key: FeedKey },

    /// A capability was revoked from a feed.
    Revoke { feed_key: FeedKey },
}

impl NodeEvent {
    /// Key of subscription related events.
    pub fn key(&self) -> Option<&EventKey> {
        match self {
            NodeEvent::Subscribed { key, .. }
            | NodeEvent::Unsubscribed { key }
            | NodeEvent::NewData { key, .. } => Some(key),
            _ => None,
        }
    }
}
