// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persistence backends for feeds.
//!
//! On disk every feed lives in its own directory. The `entries` file holds the log as a sequence
//! of frames, each a big-endian `u32` length followed by the CBOR-encoded [`SignedEntry`]. Writable
//! feeds additionally keep their 32 byte private key in a `key` file.
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use plasmid_core::PrivateKey;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::FeedError;
use crate::signed::SignedEntry;

const ENTRIES_FILE: &str = "entries";
const KEY_FILE: &str = "key";
const FRAME_HEADER_LEN: usize = 4;

/// Where a feed keeps its entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Storage {
    /// Entries are only kept in memory and are lost when the feed is dropped.
    #[default]
    Memory,

    /// Entries are persisted in the given directory.
    Directory(PathBuf),
}

impl Storage {
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self::Directory(path.into())
    }

    /// Storage for a sub-directory of this storage, or memory storage again.
    pub fn join(&self, name: &str) -> Self {
        match self {
            Storage::Memory => Storage::Memory,
            Storage::Directory(path) => Storage::Directory(path.join(name)),
        }
    }
}

/// Append-only log backend.
#[derive(Debug)]
pub(crate) struct Log {
    file: Option<File>,
}

impl Log {
    /// Open the log and load all entries which were persisted before.
    pub(crate) async fn open(storage: &Storage) -> Result<(Self, Vec<SignedEntry>), FeedError> {
        let dir = match storage {
            Storage::Memory => return Ok((Self { file: None }, Vec::new())),
            Storage::Directory(dir) => dir,
        };

        fs::create_dir_all(dir).await?;
        let path = dir.join(ENTRIES_FILE);

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let (entries, valid_len) = decode_frames(&bytes)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        if valid_len < bytes.len() {
            warn!(
                path = %path.display(),
                "truncating {} bytes of incomplete entry at end of feed",
                bytes.len() - valid_len
            );
            file.set_len(valid_len as u64).await?;
        }

        debug!(path = %path.display(), entries = entries.len(), "opened feed storage");

        Ok((Self { file: Some(file) }, entries))
    }

    pub(crate) async fn write(&mut self, record: &SignedEntry) -> Result<(), FeedError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(record, &mut bytes)
            .map_err(|err| FeedError::Encode(err.to_string()))?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + bytes.len());
        frame.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        frame.extend_from_slice(&bytes);

        file.write_all(&frame).await?;
        file.flush().await?;
        file.sync_data().await?;

        Ok(())
    }

    pub(crate) async fn close(&mut self) -> Result<(), FeedError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

/// Decode all complete frames.
///
/// Returns the entries and the number of bytes they occupy. Trailing bytes of a torn write are
/// not part of that length. A frame which can not be decoded, or whose length header points past
/// a complete record, is reported as [`FeedError::Corrupted`] with its offset.
fn decode_frames(bytes: &[u8]) -> Result<(Vec<SignedEntry>, usize), FeedError> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let Some(header) = bytes.get(offset..offset + FRAME_HEADER_LEN) else {
            break;
        };
        let mut len_bytes = [0; FRAME_HEADER_LEN];
        len_bytes.copy_from_slice(header);
        let len = u32::from_be_bytes(len_bytes) as usize;

        let start = offset + FRAME_HEADER_LEN;
        let Some(frame) = bytes.get(start..start + len) else {
            // A torn write leaves an incomplete record behind. A complete one means the length
            // header got damaged and later frames would be lost by truncating.
            if ciborium::from_reader::<SignedEntry, _>(&bytes[start..]).is_ok() {
                return Err(FeedError::Corrupted(offset as u64));
            }
            break;
        };

        let record: SignedEntry =
            ciborium::from_reader(frame).map_err(|_| FeedError::Corrupted(offset as u64))?;
        if record.entry.sequence != entries.len() as u64 {
            return Err(FeedError::Corrupted(offset as u64));
        }

        entries.push(record);
        offset = start + len;
    }

    Ok((entries, offset))
}

/// Load the private key of a writable feed, creating and persisting one if none exists yet.
///
/// A given key is only used for fresh storage; if another key was persisted before this fails
/// with [`FeedError::KeyMismatch`].
pub(crate) async fn load_or_create_key(
    storage: &Storage,
    private_key: Option<PrivateKey>,
) -> Result<PrivateKey, FeedError> {
    let dir = match storage {
        Storage::Memory => return Ok(private_key.unwrap_or_default()),
        Storage::Directory(dir) => dir,
    };

    fs::create_dir_all(dir).await?;
    let path = dir.join(KEY_FILE);

    match fs::read(&path).await {
        Ok(bytes) => {
            let stored = PrivateKey::from_bytes(&bytes)?;
            if let Some(private_key) = private_key {
                if private_key.public_key() != stored.public_key() {
                    return Err(FeedError::KeyMismatch);
                }
            }
            Ok(stored)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let private_key = private_key.unwrap_or_default();
            write_key(&path, &private_key).await?;
            debug!(path = %path.display(), "created new feed key");
            Ok(private_key)
        }
        Err(err) => Err(err.into()),
    }
}

async fn write_key(path: &Path, private_key: &PrivateKey) -> Result<(), FeedError> {
    let mut file = File::create(path).await?;
    file.write_all(&private_key.to_bytes()).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use plasmid_core::{Content, Entry, PrivateKey};
    use tokio::io::AsyncWriteExt;

    use crate::FeedError;
    use crate::signed::SignedEntry;

    use super::{ENTRIES_FILE, Log, Storage, load_or_create_key};

    fn signed_entry(private_key: &PrivateKey, sequence: u64) -> SignedEntry {
        let entry =
            Entry::new(private_key.public_key(), sequence, 0, Content::new("test")).unwrap();
        SignedEntry::sign(entry, private_key)
    }

    #[tokio::test]
    async fn persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::directory(dir.path());
        let private_key = PrivateKey::new();

        let (mut log, entries) = Log::open(&storage).await.unwrap();
        assert!(entries.is_empty());
        log.write(&signed_entry(&private_key, 0)).await.unwrap();
        log.write(&signed_entry(&private_key, 1)).await.unwrap();
        log.close().await.unwrap();

        let (_, entries) = Log::open(&storage).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].entry.sequence, 1);
        assert!(entries[1].verify(&private_key.public_key()));
    }

    #[tokio::test]
    async fn truncate_torn_write() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::directory(dir.path());
        let private_key = PrivateKey::new();

        let (mut log, _) = Log::open(&storage).await.unwrap();
        log.write(&signed_entry(&private_key, 0)).await.unwrap();
        log.close().await.unwrap();

        // Simulate a crash in the middle of writing a second frame.
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(ENTRIES_FILE))
            .await
            .unwrap();
        file.write_all(&[0, 0, 1, 0, 0xa4]).await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let (mut log, entries) = Log::open(&storage).await.unwrap();
        assert_eq!(entries.len(), 1);
        log.write(&signed_entry(&private_key, 1)).await.unwrap();
        log.close().await.unwrap();

        let (_, entries) = Log::open(&storage).await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn damaged_header_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::directory(dir.path());
        let private_key = PrivateKey::new();

        let (mut log, _) = Log::open(&storage).await.unwrap();
        let first = signed_entry(&private_key, 0);
        log.write(&first).await.unwrap();
        log.write(&signed_entry(&private_key, 1)).await.unwrap();
        log.write(&signed_entry(&private_key, 2)).await.unwrap();
        log.close().await.unwrap();

        let path = dir.path().join(ENTRIES_FILE);
        let mut bytes = tokio::fs::read(&path).await.unwrap();
        let len_before = bytes.len();

        let mut first_bytes = Vec::new();
        ciborium::into_writer(&first, &mut first_bytes).unwrap();
        let offset = 4 + first_bytes.len();
        bytes[offset..offset + 4].copy_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        tokio::fs::write(&path, &bytes).await.unwrap();

        assert_matches!(
            Log::open(&storage).await,
            Err(FeedError::Corrupted(at)) if at == offset as u64
        );
        assert_eq!(tokio::fs::read(&path).await.unwrap().len(), len_before);
    }

    #[tokio::test]
    async fn memory_storage_keeps_nothing() {
        let private_key = PrivateKey::new();
        let (mut log, _) = Log::open(&Storage::Memory).await.unwrap();
        log.write(&signed_entry(&private_key, 0)).await.unwrap();

        let (_, entries) = Log::open(&Storage::Memory).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn stored_key_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::directory(dir.path());

        let created = load_or_create_key(&storage, None).await.unwrap();
        let loaded = load_or_create_key(&storage, None).await.unwrap();
        assert_eq!(created.public_key(), loaded.public_key());

        assert_matches!(
            load_or_create_key(&storage, Some(PrivateKey::new())).await,
            Err(FeedError::KeyMismatch)
        );
    }
}
