// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures_util::Stream;
use plasmid_core::{
    Content, Entry, FeedKey, PrivateKey, SubscribeOptions, SystemContent, ValidationError, now,
    validate_entry,
};
use plasmid_store::{Feed, FeedConfig, FeedError, ReadOptions, Storage, WriteError};
use serde_json::Value;
use thiserror::Error;
use tokio::io::DuplexStream;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, warn};

use crate::builder::NodeBuilder;
use crate::context::{NodeContext, OWN_FEED_DIR};
use crate::control;
use crate::events::NodeEvent;
use crate::state::NodeState;
use crate::subscriptions::SubscriptionInfo;

/// Buffer size of in-process replication pipes.
const REPLICATION_PIPE_CAPACITY: usize = 64 * 1024;

/// A node owning one feed.
///
/// All commands are entries appended to the own feed. They resolve once the entry was persisted
/// and the control loop processed it, so after `subscribe` resolved the subscription exists and
/// after `grant` resolved the capability is recorded.
pub struct Node {
    context: Arc<NodeContext>,
    control: Option<AbortOnDropHandle<()>>,

    /// Receiver created before the control loop started, handed out by the first call to
    /// [`Node::events`].
    initial_events: Mutex<Option<broadcast::Receiver<NodeEvent>>>,
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    /// Spawn a node keeping everything in memory, with a newly generated key.
    pub async fn spawn() -> Result<Self, NodeError> {
        Node::spawn_inner(Config::default(), None).await
    }

    /// Open or create a node persisting its feeds in the given directory.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, NodeError> {
        Node::builder().storage_path(path).spawn().await
    }

    pub(crate) async fn spawn_inner(
        config: Config,
        private_key: Option<PrivateKey>,
    ) -> Result<Self, NodeError> {
        let mut feed_config =
            FeedConfig::owned(config.storage.join(OWN_FEED_DIR)).on_write(check_entry);
        if let Some(private_key) = private_key {
            feed_config = feed_config.private_key(private_key);
        }
        let feed = Feed::open(feed_config).await?;

        let (events, initial_events) = broadcast::channel(config.event_capacity);
        let (processed_tx, processed_rx) = watch::channel(0);

        let context = Arc::new(NodeContext {
            replay_length: feed.len(),
            feed,
            storage: config.storage,
            state: std::sync::RwLock::new(NodeState::default()),
            events,
            processed: processed_rx,
            shutdown: CancellationToken::new(),
        });

        debug!(
            feed = %context.feed.key(),
            entries = context.replay_length,
            "spawn node"
        );

        let handle = tokio::spawn(control::run(context.clone(), processed_tx));

        Ok(Node {
            context,
            control: Some(AbortOnDropHandle::new(handle)),
            initial_events: Mutex::new(Some(initial_events)),
        })
    }

    /// Key of the own feed.
    pub fn feed_key(&self) -> &FeedKey {
        self.context.feed.key()
    }

    /// Number of entries in the own feed.
    pub fn len(&self) -> u64 {
        self.context.feed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.context.feed.is_empty()
    }

    /// Latest entry of the own feed.
    pub fn head(&self) -> Option<Entry> {
        self.context.feed.head()
    }

    pub fn get(&self, index: u64) -> Option<Entry> {
        self.context.feed.get(index)
    }

    /// Subscribe to a foreign feed.
    ///
    /// Subscribing again replaces the previous subscription. Entries older than this subscription
    /// are not published as [`NodeEvent::NewData`].
    pub async fn subscribe(
        &self,
        feed_key: impl AsRef<str>,
        details: Value,
        options: SubscribeOptions,
    ) -> Result<Entry, NodeError> {
        let feed_key = parse_feed_key(feed_key)?;
        self.command(SystemContent::subscribe(feed_key, details, options).into()).await
    }

    pub async fn unsubscribe(&self, feed_key: impl AsRef<str>) -> Result<Entry, NodeError> {
        let feed_key = parse_feed_key(feed_key)?;
        self.command(SystemContent::unsubscribe(feed_key).into()).await
    }

    /// Allow a feed to have content relayed into the own feed.
    ///
    /// Relayed content needs to match the given JSON schema, without a schema everything but
    /// control entries is accepted.
    pub async fn grant(
        &self,
        feed_key: impl AsRef<str>,
        schema: Option<Value>,
    ) -> Result<Entry, NodeError> {
        let feed_key = parse_feed_key(feed_key)?;
        self.command(SystemContent::grant(feed_key, schema).into()).await
    }

    pub async fn revoke(&self, feed_key: impl AsRef<str>) -> Result<Entry, NodeError> {
        let feed_key = parse_feed_key(feed_key)?;
        self.command(SystemContent::revoke(feed_key).into()).await
    }

    /// Append application content.
    ///
    /// Object payloads become the fields of the content, other payloads are kept in a `payload`
    /// field.
    pub async fn append_content(
        &self,
        content_type: &str,
        payload: Value,
    ) -> Result<Entry, NodeError> {
        if content_type.is_empty() {
            return Err(NodeError::InvalidArgument("content type is empty".to_string()));
        }
        self.command(Content::with_payload(content_type, payload)).await
    }

    /// Append an entry with explicitly chosen sequence number and timestamp.
    ///
    /// Fails with [`NodeError::SequenceMismatch`] if the sequence number is not the current length
    /// of the own feed.
    pub async fn append_entry(&self, entry: Entry) -> Result<Entry, NodeError> {
        self.context.feed.append(entry.clone()).await?;
        self.processed(entry.sequence).await?;
        Ok(entry)
    }

    /// Append an untyped record, checked against the entry schema first.
    pub async fn append_value(&self, value: Value) -> Result<Entry, NodeError> {
        let entry = Entry::from_value(value)?;
        self.append_entry(entry).await
    }

    /// Stream the entries of the own feed or of a subscribed feed.
    pub fn read_stream(
        &self,
        feed_key: Option<&FeedKey>,
        options: ReadOptions,
    ) -> Result<impl Stream<Item = Entry> + Send + use<>, NodeError> {
        Ok(self.feed(feed_key)?.read_stream(options))
    }

    /// Byte stream replicating the own feed or a subscribed feed.
    ///
    /// Connect the returned stream to a remote peer running a replication stream for the same
    /// feed with the opposite `is_initiator` flag.
    pub fn replication_stream(
        &self,
        feed_key: Option<&FeedKey>,
        is_initiator: bool,
    ) -> Result<DuplexStream, NodeError> {
        let feed = self.feed(feed_key)?;
        let (local, remote) = tokio::io::duplex(REPLICATION_PIPE_CAPACITY);

        tokio::spawn(async move {
            if let Err(err) = feed.replicate(is_initiator, local).await {
                warn!(feed = %feed.key(), "replication failed: {err}");
            }
        });

        Ok(remote)
    }

    /// Handle of the own feed (`None`) or a subscribed feed.
    pub fn feed(&self, feed_key: Option<&FeedKey>) -> Result<Feed, NodeError> {
        match feed_key {
            None => Ok(self.context.feed.clone()),
            Some(feed_key) => self
                .context
                .feed_for(feed_key)
                .ok_or_else(|| NodeError::NotSubscribed(feed_key.clone())),
        }
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut subscriptions: Vec<SubscriptionInfo> = self
            .context
            .read_state()
            .subscriptions
            .values()
            .map(|subscription| subscription.info())
            .collect();
        subscriptions.sort_by(|a, b| a.feed_key.cmp(&b.feed_key));
        subscriptions
    }

    pub fn subscription(&self, feed_key: &FeedKey) -> Option<SubscriptionInfo> {
        self.context
            .read_state()
            .subscriptions
            .get(feed_key)
            .map(|subscription| subscription.info())
    }

    pub fn is_subscribed(&self, feed_key: &FeedKey) -> bool {
        self.context
            .read_state()
            .subscriptions
            .contains_key(feed_key)
    }

    pub fn aliases(&self) -> HashMap<String, FeedKey> {
        self.context.read_state().aliases.clone()
    }

    pub fn capabilities(&self) -> HashMap<FeedKey, Value> {
        self.context.read_state().capabilities.clone().into()
    }

    /// Content validation schema granted to a feed.
    pub fn capability(&self, feed_key: &FeedKey) -> Option<Value> {
        self.context
            .read_state()
            .capabilities
            .get(feed_key)
            .cloned()
    }

    /// Receiver for node events.
    ///
    /// The first receiver sees all events since the node was spawned, including the replay of the
    /// own feed. Later receivers only see events from the moment they were created.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        let initial = self
            .initial_events
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        initial.unwrap_or_else(|| self.context.events.subscribe())
    }

    /// Wait until the control loop processed every entry the own feed holds right now.
    pub async fn caught_up(&self) -> Result<(), NodeError> {
        match self.len() {
            0 => Ok(()),
            length => self.processed(length - 1).await,
        }
    }

    /// Stop the control loop and all subscriptions, then close the own feed.
    ///
    /// A dispatch in progress is finished first.
    pub async fn close(mut self) -> Result<(), NodeError> {
        self.context.shutdown.cancel();

        if let Some(control) = self.control.take() {
            if let Err(err) = control.await {
                error!("control loop failed: {err}");
            }
        }

        let subscriptions: Vec<_> = self
            .context
            .write_state()
            .subscriptions
            .drain()
            .map(|(_, subscription)| subscription)
            .collect();
        for subscription in subscriptions {
            subscription.stop().await;
        }

        self.context.feed.close().await?;
        debug!(feed = %self.feed_key(), "closed node");

        Ok(())
    }

    pub(crate) fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    async fn command(&self, content: Content) -> Result<Entry, NodeError> {
        let author = self.feed_key().clone();
        let entry = self
            .context
            .feed
            .append_next(|index| Entry {
                author,
                sequence: index,
                timestamp: now(),
                content,
                remote_author: None,
                remote_sequence: None,
            })
            .await?;
        self.processed(entry.sequence).await?;
        Ok(entry)
    }

    async fn processed(&self, index: u64) -> Result<(), NodeError> {
        if self.context.wait_processed(index).await {
            Ok(())
        } else {
            Err(NodeError::Closed)
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // Stops subscription listeners of nodes which were not closed.
        self.context.shutdown.cancel();
    }
}

/// Write hook of the own feed.
fn check_entry(index: u64, entry: &Entry) -> Result<(), WriteError> {
    if entry.sequence != index {
        return Err(WriteError::SequenceMismatch {
            expected: index,
            got: entry.sequence,
        });
    }

    validate_entry(entry)?;

    Ok(())
}

fn parse_feed_key(feed_key: impl AsRef<str>) -> Result<FeedKey, NodeError> {
    feed_key
        .as_ref()
        .parse()
        .map_err(|err| NodeError::InvalidArgument(format!("feed key: {err}")))
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Where the own feed and the mirrors of subscribed feeds are kept.
    pub storage: Storage,

    /// Number of events buffered for slow receivers before they lag.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: Storage::Memory,
            event_capacity: 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("sequence number in entry is not correct, expected {expected} got {got}")]
    SequenceMismatch { expected: u64, got: u64 },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(std::io::Error),

    #[error("not subscribed to feed {0}")]
    NotSubscribed(FeedKey),

    #[error("node is closed")]
    Closed,

    #[error(transparent)]
    Feed(FeedError),
}

impl From<FeedError> for NodeError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::Rejected(WriteError::SequenceMismatch { expected, got }) => {
                NodeError::SequenceMismatch { expected, got }
            }
            FeedError::Rejected(WriteError::Invalid(err)) => NodeError::Validation(err),
            FeedError::StorageUnavailable(err) => NodeError::StorageUnavailable(err),
            FeedError::Closed => NodeError::Closed,
            err => NodeError::Feed(err),
        }
    }
}
