// SPDX-License-Identifier: MIT OR Apache-2.0

//! Live replication of a single feed over a bidirectional byte stream.
//!
//! Both peers first exchange a handshake with the key of the feed they want to replicate and the
//! number of entries they hold. The initiator sends its handshake first, the acceptor answers
//! after reading it. From then on every side streams the entries the other one is missing, and
//! keeps streaming new entries as they get appended until either side closes the connection or the
//! feed is closed.
//!
//! ```text
//! initiator                          acceptor
//!     |------ Handshake(key, len) ------>|
//!     |<----- Handshake(key, len) -------|
//!     |<========= Entry(...) ===========>|
//! ```
//!
//! Received entries are only accepted in order and with a valid signature of the feed author.
use futures_util::{SinkExt, StreamExt};
use plasmid_core::FeedKey;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

use crate::ReplicationError;
use crate::codec::CborCodec;
use crate::feed::{Feed, ReadOptions};
use crate::signed::SignedEntry;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Handshake { feed_key: FeedKey, length: u64 },
    Entry(SignedEntry),
}

impl Feed {
    /// Replicate this feed with a remote peer over the given stream.
    ///
    /// Runs until the remote closes the stream or this feed is closed.
    pub async fn replicate<T>(&self, is_initiator: bool, io: T) -> Result<(), ReplicationError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (reader, writer) = tokio::io::split(io);
        let mut stream = FramedRead::new(reader, CborCodec::<Message>::new());
        let mut sink = FramedWrite::new(writer, CborCodec::<Message>::new());

        let local = Message::Handshake {
            feed_key: self.key().clone(),
            length: self.len(),
        };

        // The acceptor always answers, so both sides learn about a key mismatch.
        let (remote_key, remote_length) = if is_initiator {
            sink.send(local).await?;
            recv_handshake(&mut stream).await?
        } else {
            let remote = recv_handshake(&mut stream).await?;
            sink.send(local).await?;
            remote
        };

        if &remote_key != self.key() {
            return Err(ReplicationError::KeyMismatch {
                local: self.key().clone(),
                remote: remote_key,
            });
        }

        debug!(
            feed = %self.key(),
            is_initiator,
            local_length = self.len(),
            remote_length,
            "start replication"
        );

        let send = async {
            let mut entries =
                Box::pin(self.read_signed_stream(ReadOptions::live().start(remote_length)));
            while let Some(entry) = entries.next().await {
                trace!(feed = %self.key(), index = entry.entry.sequence, "send entry");
                sink.send(Message::Entry(entry)).await?;
            }
            Ok::<(), ReplicationError>(())
        };

        let receive = async {
            while let Some(message) = stream.next().await {
                match message? {
                    Message::Entry(entry) => {
                        self.insert_replicated(entry).await?;
                    }
                    Message::Handshake { .. } => {
                        return Err(ReplicationError::UnexpectedMessage("handshake"));
                    }
                }
            }
            Ok::<(), ReplicationError>(())
        };

        let result = tokio::select! {
            result = send => result,
            result = receive => result,
        };

        debug!(feed = %self.key(), ?result, "end replication");
        result
    }
}

async fn recv_handshake<R>(
    stream: &mut FramedRead<R, CborCodec<Message>>,
) -> Result<(FeedKey, u64), ReplicationError>
where
    R: AsyncRead + Unpin,
{
    match stream.next().await {
        Some(Ok(Message::Handshake { feed_key, length })) => Ok((feed_key, length)),
        Some(Ok(Message::Entry(_))) => Err(ReplicationError::UnexpectedMessage("entry")),
        Some(Err(err)) => Err(err),
        None => Err(ReplicationError::UnexpectedEnd),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use plasmid_core::{Content, Entry};
    use tokio::io::AsyncWriteExt;

    use crate::signed::SignedEntry;
    use crate::{Feed, FeedConfig, ReplicationError, Storage};

    async fn writable_feed(entries: u64) -> Feed {
        let feed = Feed::open(FeedConfig::owned(Storage::Memory)).await.unwrap();
        for index in 0..entries {
            append(&feed, index).await;
        }
        feed
    }

    async fn append(feed: &Feed, index: u64) {
        let entry = Entry::new(feed.key(), index, index, Content::new("test")).unwrap();
        feed.append(entry).await.unwrap();
    }

    async fn mirror(feed: &Feed) -> Feed {
        Feed::open(FeedConfig::foreign(feed.key().clone(), Storage::Memory))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn replicate_existing_and_new_entries() {
        let source = writable_feed(3).await;
        let target = mirror(&source).await;

        let (left, right) = tokio::io::duplex(64 * 1024);
        let source_task = {
            let source = source.clone();
            tokio::spawn(async move { source.replicate(true, left).await })
        };
        let target_task = {
            let target = target.clone();
            tokio::spawn(async move { target.replicate(false, right).await })
        };

        assert!(target.wait_for_length(3).await);
        assert_eq!(target.get(2), source.get(2));

        // Live entries arrive as well.
        append(&source, 3).await;
        assert!(target.wait_for_length(4).await);
        assert_eq!(target.head(), source.head());

        // Closing the mirror ends replication on both sides.
        target.close().await.unwrap();
        target_task.await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(1), source_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn mirrors_replicate_with_each_other() {
        let source = writable_feed(2).await;
        let first = mirror(&source).await;
        let second = mirror(&source).await;

        let (left, right) = tokio::io::duplex(64 * 1024);
        tokio::spawn({
            let source = source.clone();
            async move { source.replicate(true, left).await }
        });
        tokio::spawn({
            let first = first.clone();
            async move { first.replicate(false, right).await }
        });
        assert!(first.wait_for_length(2).await);

        // The second mirror never talks to the author directly.
        let (left, right) = tokio::io::duplex(64 * 1024);
        tokio::spawn({
            let first = first.clone();
            async move { first.replicate(true, left).await }
        });
        tokio::spawn({
            let second = second.clone();
            async move { second.replicate(false, right).await }
        });
        assert!(second.wait_for_length(2).await);

        append(&source, 2).await;
        assert!(second.wait_for_length(3).await);
    }

    #[tokio::test]
    async fn reject_other_feeds() {
        let first = writable_feed(0).await;
        let second = writable_feed(0).await;

        let (left, right) = tokio::io::duplex(64 * 1024);
        let (first_result, second_result) =
            tokio::join!(first.replicate(true, left), second.replicate(false, right));

        assert_matches!(first_result, Err(ReplicationError::KeyMismatch { .. }));
        assert_matches!(second_result, Err(ReplicationError::KeyMismatch { .. }));
    }

    #[tokio::test]
    async fn reject_forged_entries() {
        let source = writable_feed(0).await;
        let target = mirror(&source).await;

        let (left, right) = tokio::io::duplex(64 * 1024);
        let target_task = {
            let target = target.clone();
            tokio::spawn(async move { target.replicate(false, right).await })
        };

        // Speak the protocol by hand and send an entry signed with the wrong key.
        let forged = SignedEntry::sign(
            Entry::new(source.key(), 0, 0, Content::new("forged")).unwrap(),
            &plasmid_core::PrivateKey::new(),
        );
        let mut bytes = Vec::new();
        ciborium::into_writer(
            &super::Message::Handshake {
                feed_key: source.key().clone(),
                length: 1,
            },
            &mut bytes,
        )
        .unwrap();
        ciborium::into_writer(&super::Message::Entry(forged), &mut bytes).unwrap();

        let mut left = left;
        left.write_all(&bytes).await.unwrap();

        assert_matches!(
            target_task.await.unwrap(),
            Err(ReplicationError::InvalidEntry(_))
        );
        assert!(target.is_empty());
    }
}
