// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;

use plasmid_core::FeedKey;

use crate::capabilities::Capabilities;
use crate::subscriptions::Subscription;

/// Everything a node derives from replaying its own feed.
#[derive(Default)]
pub(crate) struct NodeState {
    pub capabilities: Capabilities,
    pub subscriptions: HashMap<FeedKey, Subscription>,
    pub aliases: HashMap<String, FeedKey>,

    /// Per remote author the sequence number following the last relayed request.
    relayed: HashMap<FeedKey, u64>,
}

impl NodeState {
    /// Bind an alias to a feed, replacing any earlier binding.
    pub fn bind_alias(&mut self, alias: String, feed_key: FeedKey) -> Option<FeedKey> {
        self.aliases.insert(alias, feed_key)
    }

    pub fn aliases_for(&self, feed_key: &FeedKey) -> Vec<String> {
        self.aliases
            .iter()
            .filter(|(_, bound)| *bound == feed_key)
            .map(|(alias, _)| alias.clone())
            .collect()
    }

    /// Remove all aliases bound to this feed and return them.
    pub fn unbind_aliases(&mut self, feed_key: &FeedKey) -> Vec<String> {
        let aliases = self.aliases_for(feed_key);
        for alias in &aliases {
            self.aliases.remove(alias);
        }
        aliases
    }

    pub fn mark_relayed(&mut self, remote_author: &FeedKey, remote_sequence: u64) {
        let next = self.relayed.entry(remote_author.clone()).or_default();
        *next = (*next).max(remote_sequence + 1);
    }

    pub fn is_relayed(&self, remote_author: &FeedKey, remote_sequence: u64) -> bool {
        self.relayed
            .get(remote_author)
            .is_some_and(|next| remote_sequence < *next)
    }
}

#[cfg(test)]
mod tests {
    use plasmid_core::PrivateKey;

    use super::NodeState;

    #[test]
    fn aliases_last_binding_wins() {
        let first = PrivateKey::new().public_key();
        let second = PrivateKey::new().public_key();
        let mut state = NodeState::default();

        assert_eq!(state.bind_alias("x".into(), first.clone()), None);
        state.bind_alias("y".into(), first.clone());
        assert_eq!(
            state.bind_alias("x".into(), second.clone()),
            Some(first.clone())
        );

        assert_eq!(state.aliases_for(&first), vec!["y".to_string()]);
        assert_eq!(state.aliases_for(&second), vec!["x".to_string()]);

        assert_eq!(state.unbind_aliases(&second), vec!["x".to_string()]);
        assert!(state.aliases_for(&second).is_empty());
        assert_eq!(state.aliases.len(), 1);
    }

    #[test]
    fn track_relayed_requests() {
        let remote = PrivateKey::new().public_key();
        let mut state = NodeState::default();
        assert!(!state.is_relayed(&remote, 0));

        state.mark_relayed(&remote, 4);
        assert!(state.is_relayed(&remote, 0));
        assert!(state.is_relayed(&remote, 4));
        assert!(!state.is_relayed(&remote, 5));

        // Marking an older request doesn't move the cursor back.
        state.mark_relayed(&remote, 1);
        assert!(state.is_relayed(&remote, 4));
    }
}
