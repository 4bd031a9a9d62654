// SPDX-License-Identifier: MIT OR Apache-2.0

//! Discovery of peers interested in the same feed.
//!
//! A [`Swarm`] connects peers which joined the same [`Topic`] and hands out a raw byte stream per
//! connection. What runs over these streams is up to the caller, see
//! [`Replicator`](crate::Replicator).
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use plasmid_core::Topic;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const EVENTS_CHANNEL_CAPACITY: usize = 64;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Bidirectional byte stream to a peer.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

pub enum SwarmEvent {
    /// A peer in the topic connected.
    ///
    /// Exactly one side of every connection is the initiator.
    Connection {
        stream: Box<dyn ByteStream>,
        peer: PeerId,
        is_initiator: bool,
    },

    /// A peer left the topic.
    Disconnection { peer: PeerId },
}

impl fmt::Debug for SwarmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwarmEvent::Connection {
                peer, is_initiator, ..
            } => f
                .debug_struct("Connection")
                .field("peer", peer)
                .field("is_initiator", is_initiator)
                .finish_non_exhaustive(),
            SwarmEvent::Disconnection { peer } => f
                .debug_struct("Disconnection")
                .field("peer", peer)
                .finish(),
        }
    }
}

pub trait Swarm: Send + Sync + 'static {
    /// Join a topic and receive connections to all other peers in it.
    fn join(
        &self,
        topic: Topic,
    ) -> impl Future<Output = Result<mpsc::Receiver<SwarmEvent>, SwarmError>> + Send;

    /// Leave a topic. The receiver returned when joining it ends.
    fn leave(&self, topic: Topic) -> impl Future<Output = Result<(), SwarmError>> + Send;
}

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("already joined topic {0}")]
    AlreadyJoined(Topic),

    #[error("not joined topic {0}")]
    NotJoined(Topic),
}

#[derive(Default)]
struct NetworkInner {
    next_peer: u64,
    topics: HashMap<Topic, HashMap<PeerId, mpsc::Sender<SwarmEvent>>>,
}

/// In-process network connecting all swarms created from it.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swarm endpoint of a new peer in this network.
    pub fn swarm(&self) -> MemorySwarm {
        let mut inner = self.lock();
        inner.next_peer += 1;
        MemorySwarm {
            id: PeerId(inner.next_peer),
            network: self.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// Swarm of a single peer in a [`MemoryNetwork`], connected through in-memory pipes.
#[derive(Clone)]
pub struct MemorySwarm {
    id: PeerId,
    network: MemoryNetwork,
}

impl MemorySwarm {
    pub fn id(&self) -> PeerId {
        self.id
    }
}

impl Swarm for MemorySwarm {
    async fn join(&self, topic: Topic) -> Result<mpsc::Receiver<SwarmEvent>, SwarmError> {
        let (tx, rx) = mpsc::channel(EVENTS_CHANNEL_CAPACITY);

        let mut inner = self.network.lock();
        let members = inner.topics.entry(topic).or_default();
        if members.contains_key(&self.id) {
            return Err(SwarmError::AlreadyJoined(topic));
        }

        // Forget about peers which dropped their receiver without leaving.
        members.retain(|_, sender| !sender.is_closed());

        for (peer, sender) in members.iter() {
            let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);

            let accepted = sender.try_send(SwarmEvent::Connection {
                stream: Box::new(remote),
                peer: self.id,
                is_initiator: false,
            });
            if accepted.is_err() {
                warn!(%topic, %peer, "peer is not accepting connections");
                continue;
            }

            if tx
                .try_send(SwarmEvent::Connection {
                    stream: Box::new(local),
                    peer: *peer,
                    is_initiator: true,
                })
                .is_err()
            {
                warn!(%topic, peer = %self.id, "too many peers in topic to connect to all of them");
            }
        }

        members.insert(self.id, tx);
        debug!(%topic, peer = %self.id, peers = members.len() - 1, "join topic");

        Ok(rx)
    }

    async fn leave(&self, topic: Topic) -> Result<(), SwarmError> {
        let mut inner = self.network.lock();
        let members = inner
            .topics
            .get_mut(&topic)
            .ok_or(SwarmError::NotJoined(topic))?;
        members
            .remove(&self.id)
            .ok_or(SwarmError::NotJoined(topic))?;

        for sender in members.values() {
            let _ = sender.try_send(SwarmEvent::Disconnection { peer: self.id });
        }

        if members.is_empty() {
            inner.topics.remove(&topic);
        }

        debug!(%topic, peer = %self.id, "leave topic");

        Ok(())
    }
}
