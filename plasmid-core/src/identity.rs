// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feed keys, private keys and signatures.
//!
//! Every feed is identified by the ed25519 verifying key of its single writer. The key is
//! represented as a lower-case, 64 character hex string wherever it shows up inside entries, so
//! [`FeedKey`] keeps the validated string form around and decodes the raw bytes on demand.
use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{SECRET_KEY_LENGTH, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::serde::{deserialize_hex, serialize_hex};

/// Length of a feed key in bytes.
pub const FEED_KEY_LEN: usize = 32;

/// Length of a hex-encoded feed key.
pub const FEED_KEY_HEX_LEN: usize = FEED_KEY_LEN * 2;

/// Length of an ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = ed25519_dalek::SIGNATURE_LENGTH;

/// Public identifier of a feed, the hex-encoded ed25519 key of its author.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeedKey(String);

impl FeedKey {
    pub fn from_bytes(bytes: [u8; FEED_KEY_LEN]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; FEED_KEY_LEN] {
        let mut bytes = [0; FEED_KEY_LEN];
        hex::decode_to_slice(&self.0, &mut bytes).expect("feed key holds validated hex string");
        bytes
    }

    /// Verify a signature over `bytes` with this key.
    ///
    /// Returns `false` if the key is not a valid ed25519 point or the signature does not match.
    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> bool {
        match VerifyingKey::from_bytes(&self.to_bytes()) {
            Ok(verifying_key) => verifying_key.verify(bytes, &signature.0).is_ok(),
            Err(_) => false,
        }
    }
}

impl FromStr for FeedKey {
    type Err = FeedKeyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.is_empty() {
            return Err(FeedKeyError::Empty);
        }

        if value.len() != FEED_KEY_HEX_LEN {
            return Err(FeedKeyError::InvalidLength(value.len(), FEED_KEY_HEX_LEN));
        }

        let mut bytes = [0; FEED_KEY_LEN];
        hex::decode_to_slice(value, &mut bytes)?;

        // Normalise upper-case input so that equal keys always compare equal.
        Ok(Self::from_bytes(bytes))
    }
}

impl TryFrom<String> for FeedKey {
    type Error = FeedKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<&str> for FeedKey {
    type Error = FeedKeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FeedKey> for String {
    fn from(value: FeedKey) -> Self {
        value.0
    }
}

impl From<[u8; FEED_KEY_LEN]> for FeedKey {
    fn from(value: [u8; FEED_KEY_LEN]) -> Self {
        Self::from_bytes(value)
    }
}

impl AsRef<str> for FeedKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FeedKey").field(&self.0).finish()
    }
}

/// Private ed25519 key used for signing the entries of a feed.
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    /// Generates a new private key using the systems random number generator (CSPRNG) as a seed.
    pub fn new() -> Self {
        let mut csprng = OsRng;
        Self(SigningKey::generate(&mut csprng))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let bytes: [u8; SECRET_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(bytes.len(), SECRET_KEY_LENGTH))?;
        Ok(Self(SigningKey::from_bytes(&bytes)))
    }

    pub fn to_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.0.to_bytes()
    }

    pub fn public_key(&self) -> FeedKey {
        FeedKey::from_bytes(self.0.verifying_key().to_bytes())
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        Signature(self.0.sign(bytes))
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PrivateKey")
            .field(&self.public_key().as_str())
            .finish()
    }
}

/// ed25519 signature over the encoded bytes of an entry.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.0.to_bytes()
    }
}

impl TryFrom<&[u8]> for Signature {
    type Error = IdentityError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; SIGNATURE_LEN] = value
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(value.len(), SIGNATURE_LEN))?;
        Ok(Self(ed25519_dalek::Signature::from_bytes(&bytes)))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(self.to_bytes()))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(&self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = deserialize_hex(deserializer)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|err: IdentityError| serde::de::Error::custom(err.to_string()))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedKeyError {
    #[error("feed key is empty")]
    Empty,

    #[error("invalid feed key length {0} characters, expected {1} hex characters")]
    InvalidLength(usize, usize),

    #[error("feed key is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("invalid key material length {0} bytes, expected {1} bytes")]
    InvalidLength(usize, usize),
}
