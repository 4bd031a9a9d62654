// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single-writer, append-only feeds.
//!
//! A [`Feed`] is a cheaply clonable handle. Writable feeds hold the private key of their author and
//! accept local appends, read-only feeds mirror a foreign feed and only grow through replication.
//!
//! Appends are serialized: the next sequence number, the write hook, persistence and publishing
//! the new length all happen while holding the same lock. Readers never wait on writers, they
//! observe new entries through a `watch` channel carrying the feed length.
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures_util::stream::{self, Stream, StreamExt};
use plasmid_core::{Entry, FeedKey, PrivateKey};
use tokio::sync::{Mutex, watch};
use tracing::{debug, trace};

use crate::signed::SignedEntry;
use crate::storage::{Log, Storage, load_or_create_key};
use crate::{FeedError, ReplicationError, WriteError};

/// Check run for every local append before the entry gets persisted.
///
/// Receives the index the entry will occupy in the feed.
pub type WriteHook = Arc<dyn Fn(u64, &Entry) -> Result<(), WriteError> + Send + Sync>;

enum Identity {
    Owned(Option<PrivateKey>),
    Foreign(FeedKey),
}

/// Configuration for opening a feed.
pub struct FeedConfig {
    storage: Storage,
    identity: Identity,
    on_write: Option<WriteHook>,
}

impl FeedConfig {
    /// A writable feed. An existing key in storage is loaded, otherwise a new one is generated.
    pub fn owned(storage: Storage) -> Self {
        Self {
            storage,
            identity: Identity::Owned(None),
            on_write: None,
        }
    }

    /// A read-only mirror of the feed with the given key.
    pub fn foreign(feed_key: FeedKey, storage: Storage) -> Self {
        Self {
            storage,
            identity: Identity::Foreign(feed_key),
            on_write: None,
        }
    }

    /// Use this private key for a writable feed in fresh storage.
    pub fn private_key(mut self, private_key: PrivateKey) -> Self {
        if let Identity::Owned(_) = self.identity {
            self.identity = Identity::Owned(Some(private_key));
        }
        self
    }

    pub fn on_write<F>(mut self, hook: F) -> Self
    where
        F: Fn(u64, &Entry) -> Result<(), WriteError> + Send + Sync + 'static,
    {
        self.on_write = Some(Arc::new(hook));
        self
    }
}

/// Options for [`Feed::read_stream`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Index of the first entry to emit.
    pub start: u64,

    /// Keep the stream open and emit entries as they get appended.
    pub live: bool,

    /// Begin at the current end of the feed, ignoring `start`.
    pub tail: bool,
}

impl ReadOptions {
    /// Read from the beginning and keep following the feed.
    pub fn live() -> Self {
        Self {
            start: 0,
            live: true,
            tail: false,
        }
    }

    /// Only read entries appended from now on.
    pub fn tail() -> Self {
        Self {
            start: 0,
            live: true,
            tail: true,
        }
    }

    pub fn start(mut self, start: u64) -> Self {
        self.start = start;
        self
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct FeedState {
    length: u64,
    closed: bool,
}

struct FeedInner {
    key: FeedKey,
    private_key: Option<PrivateKey>,
    entries: RwLock<Vec<SignedEntry>>,
    log: Mutex<Log>,
    state: watch::Sender<FeedState>,
    on_write: Option<WriteHook>,
}

#[derive(Clone)]
pub struct Feed {
    inner: Arc<FeedInner>,
}

impl Feed {
    /// Open a feed, loading all previously persisted entries.
    pub async fn open(config: FeedConfig) -> Result<Self, FeedError> {
        let (key, private_key) = match config.identity {
            Identity::Owned(private_key) => {
                let private_key = load_or_create_key(&config.storage, private_key).await?;
                (private_key.public_key(), Some(private_key))
            }
            Identity::Foreign(key) => (key, None),
        };

        let (log, entries) = Log::open(&config.storage).await?;
        if let Some(signed) = entries.first() {
            if signed.entry.author != key {
                return Err(FeedError::KeyMismatch);
            }
        }

        let state = FeedState {
            length: entries.len() as u64,
            closed: false,
        };
        let (state_tx, _) = watch::channel(state);

        debug!(
            feed = %key,
            writable = private_key.is_some(),
            length = state.length,
            "open feed"
        );

        Ok(Self {
            inner: Arc::new(FeedInner {
                key,
                private_key,
                entries: RwLock::new(entries),
                log: Mutex::new(log),
                state: state_tx,
                on_write: config.on_write,
            }),
        })
    }

    pub fn key(&self) -> &FeedKey {
        &self.inner.key
    }

    pub fn is_writable(&self) -> bool {
        self.inner.private_key.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().closed
    }

    /// Number of entries in this feed.
    pub fn len(&self) -> u64 {
        self.inner.state.borrow().length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u64) -> Option<Entry> {
        self.get_signed(index).map(|signed| signed.entry)
    }

    pub fn get_signed(&self, index: u64) -> Option<SignedEntry> {
        let index = usize::try_from(index).ok()?;
        self.read_entries().get(index).cloned()
    }

    /// Most recent entry.
    pub fn head(&self) -> Option<Entry> {
        self.read_entries().last().map(|signed| signed.entry.clone())
    }

    /// Append an entry to a writable feed.
    ///
    /// Returns the index of the new entry.
    pub async fn append(&self, entry: Entry) -> Result<u64, FeedError> {
        let entry = self.append_next(|_| entry).await?;
        Ok(entry.sequence)
    }

    /// Append an entry built from the index it is going to occupy.
    ///
    /// The index is determined while holding the write lock, so concurrent callers each see the
    /// index their entry will actually end up at.
    pub async fn append_next<F>(&self, build: F) -> Result<Entry, FeedError>
    where
        F: FnOnce(u64) -> Entry,
    {
        let private_key = self
            .inner
            .private_key
            .as_ref()
            .ok_or_else(|| FeedError::ReadOnly(self.inner.key.clone()))?;

        let mut log = self.inner.log.lock().await;
        if self.is_closed() {
            return Err(FeedError::Closed);
        }

        let index = self.len();
        let entry = build(index);

        if entry.author != self.inner.key {
            return Err(WriteError::AuthorMismatch {
                expected: self.inner.key.clone(),
                got: entry.author,
            }
            .into());
        }

        if let Some(on_write) = &self.inner.on_write {
            on_write(index, &entry)?;
        }

        let signed = SignedEntry::sign(entry.clone(), private_key);
        log.write(&signed).await?;
        self.push(signed);

        trace!(
            feed = %self.inner.key,
            index,
            content_type = entry.content.content_type(),
            "append entry"
        );

        Ok(entry)
    }

    /// Insert an entry received from a remote peer.
    ///
    /// Returns `false` if the entry was already known or this feed is writable. Writable feeds are
    /// the source of truth for their entries and never accept them from others.
    pub(crate) async fn insert_replicated(
        &self,
        signed: SignedEntry,
    ) -> Result<bool, ReplicationError> {
        if self.is_writable() {
            return Ok(false);
        }

        let mut log = self.inner.log.lock().await;
        if self.is_closed() {
            return Err(FeedError::Closed.into());
        }

        let expected = self.len();
        let got = signed.entry.sequence;
        if got < expected {
            return Ok(false);
        }
        if got > expected {
            return Err(ReplicationError::Gap { expected, got });
        }

        if !signed.verify(&self.inner.key) {
            return Err(ReplicationError::InvalidEntry(format!(
                "entry {got} is not signed by the feed author"
            )));
        }
        plasmid_core::validate_entry(&signed.entry)
            .map_err(|err| ReplicationError::InvalidEntry(err.to_string()))?;

        log.write(&signed).await?;
        self.push(signed);

        trace!(feed = %self.inner.key, index = got, "insert replicated entry");

        Ok(true)
    }

    /// Stream the entries of this feed.
    ///
    /// Non-live streams end after the last entry present while reading. Live streams keep waiting
    /// for new entries and only end once the feed is closed.
    pub fn read_stream(&self, options: ReadOptions) -> impl Stream<Item = Entry> + Send + use<> {
        self.read_signed_stream(options).map(|signed| signed.entry)
    }

    pub fn read_signed_stream(
        &self,
        options: ReadOptions,
    ) -> impl Stream<Item = SignedEntry> + Send + use<> {
        let state_rx = self.inner.state.subscribe();
        let start = if options.tail {
            self.len()
        } else {
            options.start
        };
        let live = options.live;

        stream::unfold(
            (self.clone(), start, state_rx),
            move |(feed, index, mut state_rx)| async move {
                loop {
                    if let Some(signed) = feed.get_signed(index) {
                        return Some((signed, (feed, index + 1, state_rx)));
                    }

                    if !live || feed.is_closed() {
                        return None;
                    }

                    // Closing the feed or appending to it both notify the watch channel.
                    if state_rx.changed().await.is_err() {
                        return None;
                    }
                }
            },
        )
    }

    /// Wait until the feed holds at least `length` entries.
    ///
    /// Returns `false` if the feed got closed before.
    pub async fn wait_for_length(&self, length: u64) -> bool {
        let mut state_rx = self.inner.state.subscribe();
        state_rx
            .wait_for(|state| state.length >= length || state.closed)
            .await
            .map(|state| state.length >= length)
            .unwrap_or(false)
    }

    /// Close the feed.
    ///
    /// Further appends fail and live read streams end once they have caught up. Closing an already
    /// closed feed does nothing.
    pub async fn close(&self) -> Result<(), FeedError> {
        let mut log = self.inner.log.lock().await;
        if self.is_closed() {
            return Ok(());
        }

        self.inner.state.send_modify(|state| state.closed = true);
        log.close().await?;

        debug!(feed = %self.inner.key, "close feed");

        Ok(())
    }

    fn push(&self, signed: SignedEntry) {
        let length = {
            let mut entries = self.write_entries();
            entries.push(signed);
            entries.len() as u64
        };
        self.inner.state.send_modify(|state| state.length = length);
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, Vec<SignedEntry>> {
        self.inner.entries.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, Vec<SignedEntry>> {
        self.inner.entries.write().unwrap_or_else(|err| err.into_inner())
    }
}

impl fmt::Debug for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feed")
            .field("key", &self.inner.key)
            .field("writable", &self.is_writable())
            .field("length", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use futures_util::StreamExt;
    use plasmid_core::{Content, Entry, PrivateKey};

    use crate::{FeedError, Storage, WriteError};

    use super::{Feed, FeedConfig, ReadOptions};

    fn entry(feed: &Feed, sequence: u64, content_type: &str) -> Entry {
        Entry::new(feed.key(), sequence, 0, Content::new(content_type)).unwrap()
    }

    #[tokio::test]
    async fn append_and_get() {
        let feed = Feed::open(FeedConfig::owned(Storage::Memory)).await.unwrap();
        assert!(feed.is_writable());
        assert!(feed.is_empty());
        assert_eq!(feed.head(), None);

        // Append
        // ~~~~~~

        assert_eq!(feed.append(entry(&feed, 0, "first")).await.unwrap(), 0);
        assert_eq!(feed.append(entry(&feed, 1, "second")).await.unwrap(), 1);

        // Read
        // ~~~~

        assert_eq!(feed.len(), 2);
        assert_eq!(feed.get(0).unwrap().content.content_type(), "first");
        assert_eq!(feed.head().unwrap().content.content_type(), "second");
        assert_eq!(feed.get(2), None);
    }

    #[tokio::test]
    async fn write_hook_rejects_entries() {
        let feed = Feed::open(FeedConfig::owned(Storage::Memory).on_write(|index, entry| {
            if entry.sequence != index {
                return Err(WriteError::SequenceMismatch {
                    expected: index,
                    got: entry.sequence,
                });
            }
            Ok(())
        }))
        .await
        .unwrap();

        assert_matches!(
            feed.append(entry(&feed, 4, "test")).await,
            Err(FeedError::Rejected(WriteError::SequenceMismatch {
                expected: 0,
                got: 4
            }))
        );
        assert_eq!(feed.len(), 0);

        let appended = feed
            .append_next(|index| entry(&feed, index, "test"))
            .await
            .unwrap();
        assert_eq!(appended.sequence, 0);
        assert_eq!(feed.len(), 1);
    }

    #[tokio::test]
    async fn reject_entries_of_other_authors() {
        let feed = Feed::open(FeedConfig::owned(Storage::Memory)).await.unwrap();
        let other = PrivateKey::new().public_key();
        let entry = Entry::new(&other, 0, 0, Content::new("test")).unwrap();
        assert_matches!(
            feed.append(entry).await,
            Err(FeedError::Rejected(WriteError::AuthorMismatch { .. }))
        );
        assert!(feed.is_empty());
    }

    #[tokio::test]
    async fn foreign_feeds_are_read_only() {
        let feed_key = PrivateKey::new().public_key();
        let feed = Feed::open(FeedConfig::foreign(feed_key.clone(), Storage::Memory))
            .await
            .unwrap();
        assert!(!feed.is_writable());

        let entry = Entry::new(&feed_key, 0, 0, Content::new("test")).unwrap();
        assert_matches!(feed.append(entry).await, Err(FeedError::ReadOnly(_)));
    }

    #[tokio::test]
    async fn reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::directory(dir.path());

        let feed = Feed::open(FeedConfig::owned(storage.clone())).await.unwrap();
        let feed_key = feed.key().clone();
        feed.append(entry(&feed, 0, "test")).await.unwrap();
        feed.close().await.unwrap();

        let feed = Feed::open(FeedConfig::owned(storage.clone())).await.unwrap();
        assert_eq!(feed.key(), &feed_key);
        assert_eq!(feed.len(), 1);
        feed.append(entry(&feed, 1, "test")).await.unwrap();
        feed.close().await.unwrap();

        // A foreign handle for another key can't open this storage.
        let result = Feed::open(FeedConfig::foreign(
            PrivateKey::new().public_key(),
            storage,
        ))
        .await;
        assert_matches!(result, Err(FeedError::KeyMismatch));
    }

    #[tokio::test]
    async fn read_streams() {
        let feed = Feed::open(FeedConfig::owned(Storage::Memory)).await.unwrap();
        for index in 0..3 {
            feed.append(entry(&feed, index, "test")).await.unwrap();
        }

        // Non-live streams end after the last entry.
        let entries: Vec<Entry> = feed.read_stream(ReadOptions::default()).collect().await;
        assert_eq!(entries.len(), 3);

        let entries: Vec<Entry> = feed
            .read_stream(ReadOptions::default().start(2))
            .collect()
            .await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, 2);

        // Live streams wait for new entries.
        let mut live = Box::pin(feed.read_stream(ReadOptions::live()));
        let mut tail = Box::pin(feed.read_stream(ReadOptions::tail()));
        for index in 0..3 {
            assert_eq!(live.next().await.unwrap().sequence, index);
        }

        let writer = feed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.append(entry(&writer, 3, "later")).await.unwrap();
        });

        assert_eq!(live.next().await.unwrap().sequence, 3);
        assert_eq!(tail.next().await.unwrap().sequence, 3);

        // Closing ends live streams.
        feed.close().await.unwrap();
        assert_eq!(live.next().await, None);
        assert_eq!(tail.next().await, None);
        assert!(feed.is_closed());
    }

    #[tokio::test]
    async fn closed_feeds_reject_appends() {
        let feed = Feed::open(FeedConfig::owned(Storage::Memory)).await.unwrap();
        feed.close().await.unwrap();
        // Closing twice is fine.
        feed.close().await.unwrap();

        assert_matches!(
            feed.append(entry(&feed, 0, "test")).await,
            Err(FeedError::Closed)
        );
        assert!(!feed.wait_for_length(1).await);
    }
}
