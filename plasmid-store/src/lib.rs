// SPDX-License-Identifier: MIT OR Apache-2.0

//! Durable, single-writer append-only feeds.
//!
//! Every feed is identified by the public key of its author. Only the holder of the matching
//! private key can append, everyone else keeps a read-only mirror which grows by replicating with
//! other peers. Feeds can be kept in memory or persisted to a directory, see [`Storage`].
//!
//! ```ignore
//! let feed = Feed::open(FeedConfig::owned(Storage::directory("./feed"))).await?;
//! let entry = feed
//!     .append_next(|index| Entry::new(feed.key(), index, now(), Content::new("HELLO")).unwrap())
//!     .await?;
//! ```
mod codec;
mod feed;
mod replication;
mod signed;
mod storage;

use plasmid_core::{FeedKey, IdentityError, ValidationError};
use thiserror::Error;

pub use codec::CborCodec;
pub use feed::{Feed, FeedConfig, ReadOptions, WriteHook};
pub use replication::Message;
pub use signed::SignedEntry;
pub use storage::Storage;

/// Reasons for the write hook of a feed to reject an entry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WriteError {
    #[error("sequence number in entry is not correct, expected {expected} got {got}")]
    SequenceMismatch { expected: u64, got: u64 },

    #[error("entry author {got} does not match feed {expected}")]
    AuthorMismatch { expected: FeedKey, got: FeedKey },

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] std::io::Error),

    #[error("corrupted feed storage at byte offset {0}")]
    Corrupted(u64),

    #[error("could not encode entry: {0}")]
    Encode(String),

    #[error("invalid feed key in storage: {0}")]
    InvalidKey(#[from] IdentityError),

    #[error("feed storage belongs to another key")]
    KeyMismatch,

    #[error("feed {0} is read-only")]
    ReadOnly(FeedKey),

    #[error("feed is closed")]
    Closed,

    #[error("entry rejected: {0}")]
    Rejected(#[from] WriteError),
}

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("input/output error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("remote replicates feed {remote}, expected {local}")]
    KeyMismatch { local: FeedKey, remote: FeedKey },

    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),

    #[error("remote closed the connection before the handshake")]
    UnexpectedEnd,

    #[error("received entry {got}, expected {expected}")]
    Gap { expected: u64, got: u64 },

    #[error("received invalid entry: {0}")]
    InvalidEntry(String),

    #[error(transparent)]
    Feed(#[from] FeedError),
}
