// SPDX-License-Identifier: MIT OR Apache-2.0

//! Entries, the immutable records of a feed.
//!
//! An entry is created by the owner of a feed and carries the feed's key as `author`, its own
//! position in the feed as `sequence`, a creation `timestamp` in milliseconds and open-ended
//! `content`. The `sequence` is the only ordering authority; the timestamp is merely used to
//! filter already-seen data when subscribing.
//!
//! Entries coming from untrusted sources (raw records, remote peers) are checked against a fixed
//! JSON schema with [`Entry::from_value`] before they are decoded.
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::content::{Content, SystemContent};
use crate::identity::{FeedKey, FeedKeyError};

static ENTRY_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": ["author", "sequence", "timestamp", "content"],
        "properties": {
            "author": {
                "type": "string",
                "minLength": 64,
                "maxLength": 64,
                "pattern": "^[0-9a-fA-F]{64}$"
            },
            "sequence": { "type": "integer", "minimum": 0 },
            "timestamp": { "type": "integer", "minimum": 0 },
            "content": {
                "type": "object",
                "required": ["type"],
                "properties": {
                    "type": { "type": "string" }
                }
            },
            "remoteAuthor": {
                "type": "string",
                "pattern": "^[0-9a-fA-F]{64}$"
            },
            "remoteSequence": { "type": "integer", "minimum": 0 }
        },
        "dependentRequired": {
            "remoteSequence": ["remoteAuthor"]
        }
    })
});

static ENTRY_VALIDATOR: LazyLock<jsonschema::Validator> = LazyLock::new(|| {
    jsonschema::validator_for(&ENTRY_SCHEMA).expect("entry schema is a valid json schema")
});

/// The fixed JSON schema every entry needs to satisfy.
pub fn entry_schema() -> &'static Value {
    &ENTRY_SCHEMA
}

/// Current time in milliseconds since the UNIX epoch.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Key of the feed holding this entry.
    pub author: FeedKey,

    /// Zero-based position of this entry in its feed.
    pub sequence: u64,

    /// Creation time in milliseconds since the UNIX epoch.
    pub timestamp: u64,

    pub content: Content,

    /// Key of the feed which requested this entry to be relayed, set on delegated entries only.
    #[serde(
        rename = "remoteAuthor",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub remote_author: Option<FeedKey>,

    /// Sequence number of the relay request in the feed of `remote_author`.
    #[serde(
        rename = "remoteSequence",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub remote_sequence: Option<u64>,
}

impl Entry {
    /// Construct a well-formed entry.
    pub fn new(
        author: impl AsRef<str>,
        sequence: u64,
        timestamp: u64,
        content: Content,
    ) -> Result<Self, ValidationError> {
        let entry = Self {
            author: author.as_ref().parse()?,
            sequence,
            timestamp,
            content,
            remote_author: None,
            remote_sequence: None,
        };
        validate_entry(&entry)?;
        Ok(entry)
    }

    /// Tag this entry as relayed on behalf of the request at `remote_sequence` in another feed.
    pub fn with_remote_author(mut self, remote_author: FeedKey, remote_sequence: u64) -> Self {
        self.remote_author = Some(remote_author);
        self.remote_sequence = Some(remote_sequence);
        self
    }

    /// Validate an untyped record against the entry schema and decode it.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        check_schema(&value)?;
        let entry: Entry =
            serde_json::from_value(value).map_err(|err| ValidationError::Decode(err.to_string()))?;
        check_system_content(&entry)?;
        Ok(entry)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("entry can be represented as json")
    }

    /// Canonical CBOR encoding of this entry, used for signatures.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            // All values in an entry are serializable, so this can only fail on a critical IO
            // error while writing into a vector.
            .expect("CBOR encoder failed due to an critical IO error");
        bytes
    }

    /// Interpret the content of this entry as system content.
    ///
    /// Returns `None` for application content.
    pub fn system_content(&self) -> Option<Result<SystemContent, ValidationError>> {
        if self.content.is_system() {
            Some(SystemContent::try_from(&self.content))
        } else {
            None
        }
    }
}

/// Structural check of an entry against the fixed entry schema.
///
/// Entries with a reserved system content type also need a well-formed system payload.
pub fn validate_entry(entry: &Entry) -> Result<(), ValidationError> {
    check_schema(&entry.to_value())?;
    check_system_content(entry)
}

fn check_schema(value: &Value) -> Result<(), ValidationError> {
    let errors: Vec<String> = ENTRY_VALIDATOR
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::Schema { errors })
    }
}

fn check_system_content(entry: &Entry) -> Result<(), ValidationError> {
    match entry.system_content() {
        Some(result) => result.map(|_| ()),
        None => Ok(()),
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("entry does not match schema: {}", .errors.join("; "))]
    Schema { errors: Vec<String> },

    #[error("invalid author: {0}")]
    InvalidAuthor(#[from] FeedKeyError),

    #[error("content needs to be an object with a string \"type\" field")]
    MissingType,

    #[error("invalid {content_type} content: {reason}")]
    InvalidSystemContent {
        content_type: String,
        reason: String,
    },

    #[error("could not decode entry: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use crate::content::{Content, SystemContent};
    use crate::identity::{FeedKeyError, PrivateKey};

    use super::{Entry, ValidationError, validate_entry};

    const AUTHOR: &str = "736dd64fecc160e61a861b277aa1004fca014205ee09c4aebef9158cca305760";

    #[test]
    fn create_valid_entry() {
        let entry = Entry::new(AUTHOR, 0, 0, Content::new("test")).unwrap();
        assert_eq!(entry.author.as_str(), AUTHOR);
        assert_eq!(entry.content.content_type(), "test");
        assert!(validate_entry(&entry).is_ok());
        assert_eq!(entry.system_content(), None);
    }

    #[test]
    fn author_too_short() {
        assert_matches!(
            Entry::new("xxx", 0, 0, Content::new("test")),
            Err(ValidationError::InvalidAuthor(FeedKeyError::InvalidLength(3, 64)))
        );
        assert_matches!(
            Entry::new("", 0, 0, Content::new("test")),
            Err(ValidationError::InvalidAuthor(FeedKeyError::Empty))
        );
    }

    #[test]
    fn malformed_system_content() {
        let content: Content = json!({ "type": "%grant" }).try_into().unwrap();
        assert_matches!(
            Entry::new(AUTHOR, 0, 0, content),
            Err(ValidationError::InvalidSystemContent { .. })
        );
    }

    #[test]
    fn untyped_records() {
        let entry = Entry::from_value(json!({
            "author": AUTHOR,
            "sequence": 3,
            "timestamp": 100,
            "content": { "type": "HELLO", "msg": "hi" },
        }))
        .unwrap();
        assert_eq!(entry.sequence, 3);
        assert_eq!(entry.content.get("msg"), Some(&json!("hi")));
        assert_eq!(entry.remote_author, None);

        // Missing author.
        let result = Entry::from_value(json!({ "sequence": 0 }));
        assert_matches!(result, Err(ValidationError::Schema { ref errors }) if errors
            .iter()
            .any(|err| err.contains("author")));

        // Negative sequence numbers.
        assert_matches!(
            Entry::from_value(json!({
                "author": AUTHOR,
                "sequence": -1,
                "timestamp": 0,
                "content": { "type": "HELLO" },
            })),
            Err(ValidationError::Schema { .. })
        );

        // Missing content type.
        assert_matches!(
            Entry::from_value(json!({
                "author": AUTHOR,
                "sequence": 0,
                "timestamp": 0,
                "content": { "msg": "hi" },
            })),
            Err(ValidationError::Schema { .. })
        );
    }

    #[test]
    fn remote_author_field() {
        let remote = PrivateKey::new().public_key();
        let entry = Entry::new(AUTHOR, 1, 0, Content::new("FROM_BOB"))
            .unwrap()
            .with_remote_author(remote.clone(), 7);

        let value = entry.to_value();
        assert_eq!(value["remoteAuthor"], json!(remote.as_str()));
        assert_eq!(value["remoteSequence"], json!(7));
        assert_eq!(Entry::from_value(value).unwrap(), entry);

        // The fields are omitted when not set.
        let entry = Entry::new(AUTHOR, 1, 0, Content::new("HELLO")).unwrap();
        assert!(entry.to_value().get("remoteAuthor").is_none());
        assert!(entry.to_value().get("remoteSequence").is_none());

        // A remote sequence without remote author is meaningless.
        assert_matches!(
            Entry::from_value(json!({
                "author": AUTHOR,
                "sequence": 0,
                "timestamp": 0,
                "content": { "type": "HELLO" },
                "remoteSequence": 3,
            })),
            Err(ValidationError::Schema { .. })
        );
    }

    #[test]
    fn system_entries() {
        let feed_key = PrivateKey::new().public_key();
        let entry = Entry::new(
            AUTHOR,
            0,
            0,
            SystemContent::revoke(feed_key.clone()).into(),
        )
        .unwrap();

        assert_eq!(
            entry.system_content(),
            Some(Ok(SystemContent::revoke(feed_key)))
        );
    }

    #[test]
    fn cbor_encoding_is_stable() {
        let entry = Entry::new(AUTHOR, 0, 0, Content::new("test").with("b", 1).with("a", 2))
            .unwrap();
        assert_eq!(entry.to_bytes(), entry.clone().to_bytes());

        let decoded: Entry = ciborium::from_reader(entry.to_bytes().as_slice()).unwrap();
        assert_eq!(decoded, entry);
    }
}
