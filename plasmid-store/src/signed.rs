// SPDX-License-Identifier: MIT OR Apache-2.0

use plasmid_core::{Entry, FeedKey, PrivateKey, Signature};
use serde::{Deserialize, Serialize};

/// An entry together with the signature of its author.
///
/// This is the unit which gets persisted and exchanged with other peers. The signature covers the
/// canonical CBOR encoding of the entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedEntry {
    pub entry: Entry,
    pub signature: Signature,
}

impl SignedEntry {
    pub fn sign(entry: Entry, private_key: &PrivateKey) -> Self {
        let signature = private_key.sign(&entry.to_bytes());
        Self { entry, signature }
    }

    /// Returns `true` if the entry was authored and signed by the owner of the given feed.
    pub fn verify(&self, feed_key: &FeedKey) -> bool {
        &self.entry.author == feed_key && feed_key.verify(&self.entry.to_bytes(), &self.signature)
    }
}
