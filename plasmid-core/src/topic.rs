// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::FeedKey;

const TOPIC_LENGTH: usize = 32;

/// Discovery topic under which peers interested in the same feed find each other.
///
/// The topic is a one-way hash of the feed key, so joining the swarm for a feed is a pure function
/// of its key and does not reveal the key itself to peers who don't know it already.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic([u8; TOPIC_LENGTH]);

impl Topic {
    pub fn from_feed_key(feed_key: &FeedKey) -> Self {
        Self(*blake3::hash(feed_key.as_str().as_bytes()).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; TOPIC_LENGTH] {
        &self.0
    }
}

impl From<&FeedKey> for Topic {
    fn from(value: &FeedKey) -> Self {
        Self::from_feed_key(value)
    }
}

impl From<[u8; TOPIC_LENGTH]> for Topic {
    fn from(topic: [u8; TOPIC_LENGTH]) -> Self {
        Self(topic)
    }
}

impl From<Topic> for [u8; TOPIC_LENGTH] {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", hex::encode(&self.0[..8]))
    }
}

#[cfg(test)]
mod tests {
    use crate::identity::PrivateKey;

    use super::Topic;

    #[test]
    fn derived_from_feed_key() {
        let feed_key = PrivateKey::new().public_key();
        assert_eq!(Topic::from_feed_key(&feed_key), Topic::from(&feed_key));
        assert_ne!(
            Topic::from_feed_key(&feed_key),
            Topic::from_feed_key(&PrivateKey::new().public_key())
        );
        assert_ne!(topic_bytes(&feed_key), feed_key.to_bytes());
    }

    fn topic_bytes(feed_key: &crate::FeedKey) -> [u8; 32] {
        Topic::from_feed_key(feed_key).into()
    }
}
