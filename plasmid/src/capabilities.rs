// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capabilities for delegated authorship.
//!
//! Granting a capability to a feed allows its author to have content relayed into the own feed.
//! Requests are checked against the schema recorded with the grant; without a grant they are
//! ignored.
use std::collections::HashMap;

use plasmid_core::{Content, FeedKey, validate};
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Capabilities(HashMap<FeedKey, Value>);

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the content validation schema for a feed, replacing an earlier grant.
    pub fn grant(&mut self, feed_key: FeedKey, schema: Value) -> Option<Value> {
        self.0.insert(feed_key, schema)
    }

    pub fn revoke(&mut self, feed_key: &FeedKey) -> Option<Value> {
        self.0.remove(feed_key)
    }

    pub fn get(&self, feed_key: &FeedKey) -> Option<&Value> {
        self.0.get(feed_key)
    }

    pub fn contains(&self, feed_key: &FeedKey) -> bool {
        self.0.contains_key(feed_key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FeedKey, &Value)> {
        self.0.iter()
    }

    /// Check if content requested by `remote_author` may be relayed.
    pub fn authorize(
        &self,
        remote_author: &FeedKey,
        remote_content: &Content,
    ) -> Result<(), Denied> {
        let schema = self.get(remote_author).ok_or(Denied::NoCapability)?;

        // Control entries can't be injected by others, regardless of the granted schema.
        if remote_content.is_system() {
            return Err(Denied::SystemContent(
                remote_content.content_type().to_string(),
            ));
        }

        let validation = validate(&remote_content.to_value(), schema);
        if !validation.is_valid() {
            return Err(Denied::SchemaViolation {
                errors: validation.errors,
            });
        }

        Ok(())
    }
}

impl From<Capabilities> for HashMap<FeedKey, Value> {
    fn from(value: Capabilities) -> Self {
        value.0
    }
}

/// Reasons for not relaying remote content.
///
/// These are never surfaced as errors to the node, foreign feeds can't make it fail.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Denied {
    #[error("no capability granted")]
    NoCapability,

    #[error("relaying {0} content is not allowed")]
    SystemContent(String),

    #[error("remote content violates granted schema: {}", .errors.join("; "))]
    SchemaViolation { errors: Vec<String> },
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use plasmid_core::{Content, PrivateKey, SystemContent};
    use serde_json::json;

    use super::{Capabilities, Denied};

    #[test]
    fn grant_and_revoke() {
        let feed_key = PrivateKey::new().public_key();
        let mut capabilities = Capabilities::new();

        assert_eq!(capabilities.grant(feed_key.clone(), json!({})), None);
        assert!(capabilities.contains(&feed_key));
        assert_eq!(
            capabilities.grant(feed_key.clone(), json!({ "type": "object" })),
            Some(json!({}))
        );
        assert_eq!(capabilities.len(), 1);

        assert_eq!(
            capabilities.revoke(&feed_key),
            Some(json!({ "type": "object" }))
        );
        assert!(capabilities.is_empty());
        assert_eq!(capabilities.revoke(&feed_key), None);
    }

    #[test]
    fn authorize_remote_content() {
        let remote = PrivateKey::new().public_key();
        let content = Content::new("PAYMENT").with("amount", 50);
        let mut capabilities = Capabilities::new();

        // Without a grant every request is denied.
        assert_eq!(
            capabilities.authorize(&remote, &content),
            Err(Denied::NoCapability)
        );

        capabilities.grant(remote.clone(), json!({}));
        assert_eq!(capabilities.authorize(&remote, &content), Ok(()));

        capabilities.grant(
            remote.clone(),
            json!({
                "type": "object",
                "properties": { "amount": { "type": "integer", "maximum": 10 } }
            }),
        );
        assert_matches!(
            capabilities.authorize(&remote, &content),
            Err(Denied::SchemaViolation { errors }) if errors.len() == 1
        );

        // Even an accept-anything grant does not allow control entries.
        capabilities.grant(remote.clone(), json!({}));
        let system: Content = SystemContent::grant(remote.clone(), None).into();
        assert_matches!(
            capabilities.authorize(&remote, &system),
            Err(Denied::SystemContent(_))
        );
    }
}
