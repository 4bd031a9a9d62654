// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use plasmid_core::FeedKey;
use plasmid_store::{Feed, Storage};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::events::NodeEvent;
use crate::state::NodeState;

/// Directory of the own feed inside the node's storage.
pub(crate) const OWN_FEED_DIR: &str = "feed";

/// Directory holding one sub-directory per subscribed feed.
pub(crate) const SUBSCRIPTIONS_DIR: &str = "subscriptions";

/// State shared between the node handle, the control loop and all subscription listeners.
pub(crate) struct NodeContext {
    pub feed: Feed,
    pub storage: Storage,
    pub state: RwLock<NodeState>,
    pub events: broadcast::Sender<NodeEvent>,

    /// Number of own-feed entries the control loop has dispatched.
    pub processed: watch::Receiver<u64>,

    /// Length of the own feed when the node was started.
    pub replay_length: u64,

    pub shutdown: CancellationToken,
}

impl NodeContext {
    pub fn emit(&self, event: NodeEvent) {
        // Sending only fails when nobody is listening.
        let _ = self.events.send(event);
    }

    pub fn read_state(&self) -> RwLockReadGuard<'_, NodeState> {
        self.state.read().unwrap_or_else(|err| err.into_inner())
    }

    pub fn write_state(&self) -> RwLockWriteGuard<'_, NodeState> {
        self.state.write().unwrap_or_else(|err| err.into_inner())
    }

    /// Storage location for the mirror of a subscribed feed.
    pub fn subscription_storage(&self, feed_key: &FeedKey) -> Storage {
        self.storage.join(SUBSCRIPTIONS_DIR).join(feed_key.as_str())
    }

    /// Handle of the own feed or of a subscribed feed.
    pub fn feed_for(&self, feed_key: &FeedKey) -> Option<Feed> {
        if feed_key == self.feed.key() {
            return Some(self.feed.clone());
        }

        self.read_state()
            .subscriptions
            .get(feed_key)
            .map(|subscription| subscription.feed().clone())
    }

    /// Wait until the control loop dispatched the entry at `index`.
    ///
    /// Returns `false` if the control loop stopped before.
    pub async fn wait_processed(&self, index: u64) -> bool {
        let mut processed = self.processed.clone();
        processed
            .wait_for(|processed| *processed > index)
            .await
            .is_ok()
    }

    /// Wait until all entries present at startup have been dispatched.
    pub async fn wait_replayed(&self) -> bool {
        match self.replay_length {
            0 => true,
            length => self.wait_processed(length - 1).await,
        }
    }
}
