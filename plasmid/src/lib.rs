// SPDX-License-Identifier: MIT OR Apache-2.0

//! Nodes owning a self-describing append-only feed.
//!
//! A node owns exactly one feed, which is its data channel and its control plane at the same
//! time: subscribing to other feeds, unsubscribing and granting capabilities are entries in the
//! node's own feed. The node replays its feed from the start and keeps tailing it, deriving its
//! subscriptions, aliases and capabilities from it. Restarting a node from the same storage thus
//! restores the same state without any extra bookkeeping.
//!
//! ```no_run
//! # async fn run() -> Result<(), plasmid::NodeError> {
//! use plasmid::{Node, NodeEvent};
//! use plasmid_core::SubscribeOptions;
//! use serde_json::json;
//!
//! let node = Node::open("./data").await?;
//! let mut events = node.events();
//!
//! node.subscribe(
//!     "736dd64fecc160e61a861b277aa1004fca014205ee09c4aebef9158cca305760",
//!     json!({ "name": "bob" }),
//!     SubscribeOptions::new().with_alias("friend"),
//! )
//! .await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let NodeEvent::NewData { key, entry, .. } = event {
//!         println!("{key}: {}", entry.content.content_type());
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Feeds are exchanged with other peers by a [`Replicator`], which joins a [`Swarm`] topic per
//! feed and replicates over every connection found there.
mod builder;
pub mod capabilities;
mod context;
mod control;
mod events;
mod node;
mod replicator;
mod state;
mod subscriptions;
pub mod swarm;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use builder::NodeBuilder;
pub use capabilities::{Capabilities, Denied};
pub use events::{EventKey, NodeEvent};
pub use node::{Config, Node, NodeError};
pub use plasmid_store::ReadOptions;
pub use replicator::{Replicator, ReplicatorEvent};
pub use subscriptions::SubscriptionInfo;
pub use swarm::{ByteStream, MemoryNetwork, MemorySwarm, PeerId, Swarm, SwarmError, SwarmEvent};

/// Open or create a node persisting its feeds in the given directory.
pub async fn open(path: impl Into<std::path::PathBuf>) -> Result<Node, NodeError> {
    Node::open(path).await
}

pub fn builder() -> NodeBuilder {
    Node::builder()
}
