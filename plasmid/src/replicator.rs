// SPDX-License-Identifier: MIT OR Apache-2.0

//! Replication of the own feed and all subscribed feeds with peers found through a swarm.
//!
//! The replicator joins the topic of the own feed and one topic per subscribed feed, following
//! the node's subscribe and unsubscribe events. Every connection in a topic is handed to the
//! replication protocol of the matching feed.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use plasmid_core::{FeedKey, Topic};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::StreamMap;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, warn};

use crate::context::NodeContext;
use crate::events::{EventKey, NodeEvent};
use crate::node::Node;
use crate::swarm::{ByteStream, PeerId, Swarm, SwarmEvent};

const EVENTS_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicatorEvent {
    /// Joined the topic of a feed.
    NewSwarm { feed_key: FeedKey },

    /// Left the topic of a feed.
    RemovedSwarm { feed_key: FeedKey },

    /// Started replicating a feed with a peer.
    Connection { feed_key: FeedKey, peer: PeerId },

    /// Stopped replicating a feed with a peer.
    Disconnection { feed_key: FeedKey, peer: PeerId },
}

/// Connected peers per feed, with the id of the connection to them.
type Peers = Arc<RwLock<HashMap<FeedKey, HashMap<PeerId, u64>>>>;

/// Handle of the replication task. Replication stops when this is dropped or the node is closed.
pub struct Replicator {
    events: broadcast::Sender<ReplicatorEvent>,
    peers: Peers,
    _handle: AbortOnDropHandle<()>,
}

impl Replicator {
    pub fn spawn<S>(node: &Node, swarm: S) -> Self
    where
        S: Swarm,
    {
        let (events, _) = broadcast::channel(EVENTS_CHANNEL_CAPACITY);
        let peers = Peers::default();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let actor = ReplicatorActor {
            // Subscribe before looking at the current subscriptions, so none is missed.
            node_events: node.context().events.subscribe(),
            context: node.context().clone(),
            swarm,
            swarms: StreamMap::new(),
            peers: peers.clone(),
            events: events.clone(),
            closed_tx,
            closed_rx,
            next_connection: 0,
        };

        let handle = tokio::spawn(actor.run());

        Self {
            events,
            peers,
            _handle: AbortOnDropHandle::new(handle),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ReplicatorEvent> {
        self.events.subscribe()
    }

    /// Peers currently replicating the given feed with us.
    pub fn peers(&self, feed_key: &FeedKey) -> Vec<PeerId> {
        let peers = self.peers.read().unwrap_or_else(|err| err.into_inner());
        let mut peers: Vec<PeerId> = peers
            .get(feed_key)
            .map(|peers| peers.keys().copied().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }
}

struct ReplicatorActor<S> {
    context: Arc<NodeContext>,
    swarm: S,
    node_events: broadcast::Receiver<NodeEvent>,
    swarms: StreamMap<FeedKey, ReceiverStream<SwarmEvent>>,
    peers: Peers,
    events: broadcast::Sender<ReplicatorEvent>,
    closed_tx: mpsc::UnboundedSender<(FeedKey, PeerId, u64)>,
    closed_rx: mpsc::UnboundedReceiver<(FeedKey, PeerId, u64)>,
    next_connection: u64,
}

impl<S> ReplicatorActor<S>
where
    S: Swarm,
{
    async fn run(mut self) {
        self.join(self.context.feed.key().clone()).await;
        self.sync_swarms().await;

        loop {
            tokio::select! {
                biased;
                _ = self.context.shutdown.cancelled() => break,
                event = self.node_events.recv() => match event {
                    Ok(NodeEvent::Subscribed { key: EventKey::Feed(feed_key), .. }) => {
                        // A replaced subscription comes with a new feed handle, connections of the
                        // old one end with it.
                        self.leave(&feed_key).await;
                        self.join(feed_key).await;
                    }
                    Ok(NodeEvent::Unsubscribed { key: EventKey::Feed(feed_key) }) => {
                        self.leave(&feed_key).await;
                    }
                    Ok(_) => (),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "replicator missed node events");
                        self.sync_swarms().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some((feed_key, event)) = self.swarms.next() => {
                    self.on_swarm_event(feed_key, event);
                }
                Some((feed_key, peer, connection)) = self.closed_rx.recv() => {
                    self.on_disconnection(&feed_key, peer, Some(connection));
                }
            }
        }

        let feed_keys: Vec<FeedKey> = self.swarms.keys().cloned().collect();
        for feed_key in feed_keys {
            self.leave(&feed_key).await;
        }
    }

    /// Join topics of all subscribed feeds and leave topics of feeds not subscribed anymore.
    async fn sync_swarms(&mut self) {
        let own_key = self.context.feed.key().clone();
        let subscribed: HashSet<FeedKey> = self
            .context
            .read_state()
            .subscriptions
            .keys()
            .cloned()
            .collect();

        let stale: Vec<FeedKey> = self
            .swarms
            .keys()
            .filter(|feed_key| **feed_key != own_key && !subscribed.contains(feed_key))
            .cloned()
            .collect();
        for feed_key in stale {
            self.leave(&feed_key).await;
        }

        for feed_key in subscribed {
            self.join(feed_key).await;
        }
    }

    async fn join(&mut self, feed_key: FeedKey) {
        if self.swarms.contains_key(&feed_key) {
            return;
        }

        match self.swarm.join(Topic::from_feed_key(&feed_key)).await {
            Ok(rx) => {
                debug!(feed = %feed_key, "join swarm");
                self.swarms
                    .insert(feed_key.clone(), ReceiverStream::new(rx));
                self.emit(ReplicatorEvent::NewSwarm { feed_key });
            }
            Err(err) => warn!(feed = %feed_key, "could not join swarm: {err}"),
        }
    }

    async fn leave(&mut self, feed_key: &FeedKey) {
        if self.swarms.remove(feed_key).is_none() {
            return;
        }

        if let Err(err) = self.swarm.leave(Topic::from_feed_key(feed_key)).await {
            warn!(feed = %feed_key, "could not leave swarm: {err}");
        }

        let peers = self.write_peers().remove(feed_key).unwrap_or_default();
        for peer in peers.into_keys() {
            self.emit(ReplicatorEvent::Disconnection {
                feed_key: feed_key.clone(),
                peer,
            });
        }

        debug!(feed = %feed_key, "leave swarm");
        self.emit(ReplicatorEvent::RemovedSwarm {
            feed_key: feed_key.clone(),
        });
    }

    fn on_swarm_event(&mut self, feed_key: FeedKey, event: SwarmEvent) {
        match event {
            SwarmEvent::Connection {
                stream,
                peer,
                is_initiator,
            } => self.on_connection(feed_key, stream, peer, is_initiator),
            SwarmEvent::Disconnection { peer } => self.on_disconnection(&feed_key, peer, None),
        }
    }

    fn on_connection(
        &mut self,
        feed_key: FeedKey,
        stream: Box<dyn ByteStream>,
        peer: PeerId,
        is_initiator: bool,
    ) {
        let Some(feed) = self.context.feed_for(&feed_key) else {
            debug!(feed = %feed_key, %peer, "drop connection for feed which is not subscribed");
            return;
        };

        if self
            .read_peers()
            .get(&feed_key)
            .is_some_and(|peers| peers.contains_key(&peer))
        {
            debug!(feed = %feed_key, %peer, "drop duplicate connection");
            return;
        }

        let connection = self.next_connection;
        self.next_connection += 1;
        self.write_peers()
            .entry(feed_key.clone())
            .or_default()
            .insert(peer, connection);

        debug!(feed = %feed_key, %peer, is_initiator, "replicate with peer");
        self.emit(ReplicatorEvent::Connection {
            feed_key: feed_key.clone(),
            peer,
        });

        let closed_tx = self.closed_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = feed.replicate(is_initiator, stream).await {
                debug!(feed = %feed_key, %peer, "replication ended: {err}");
            }
            let _ = closed_tx.send((feed_key, peer, connection));
        });
    }

    /// Forget a peer. With a connection id given, only if it is still the same connection.
    fn on_disconnection(&mut self, feed_key: &FeedKey, peer: PeerId, connection: Option<u64>) {
        let removed = {
            let mut peers = self.write_peers();
            let current = peers
                .get(feed_key)
                .and_then(|connections| connections.get(&peer))
                .copied();
            let removed = match (current, connection) {
                (Some(current), Some(connection)) => current == connection,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if removed {
                if let Some(connections) = peers.get_mut(feed_key) {
                    connections.remove(&peer);
                }
            }
            removed
        };

        if removed {
            debug!(feed = %feed_key, %peer, "peer disconnected");
            self.emit(ReplicatorEvent::Disconnection {
                feed_key: feed_key.clone(),
                peer,
            });
        }
    }

    fn emit(&self, event: ReplicatorEvent) {
        let _ = self.events.send(event);
    }

    fn read_peers(&self) -> RwLockReadGuard<'_, HashMap<FeedKey, HashMap<PeerId, u64>>> {
        self.peers.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write_peers(&self) -> RwLockWriteGuard<'_, HashMap<FeedKey, HashMap<PeerId, u64>>> {
        self.peers.write().unwrap_or_else(|err| err.into_inner())
    }
}
