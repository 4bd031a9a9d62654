// SPDX-License-Identifier: MIT OR Apache-2.0

//! Entry content and the reserved system content types.
//!
//! Content is an open-ended JSON object which always carries a string `type` field. A handful of
//! `%`-prefixed types are reserved for the control plane of a node: they are interpreted by every
//! node replaying its own feed, everything else is regular application data.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entry::ValidationError;
use crate::identity::FeedKey;

pub const SUBSCRIBE: &str = "%subscribe";
pub const UNSUBSCRIBE: &str = "%unsubscribe";
pub const GRANT: &str = "%grant";
pub const REVOKE: &str = "%revoke";
pub const REMOTE_AUTHOR: &str = "%remoteauthor";

/// All content types interpreted by the control plane.
pub const SYSTEM_TYPES: [&str; 5] = [SUBSCRIBE, UNSUBSCRIBE, GRANT, REVOKE, REMOTE_AUTHOR];

const TYPE_FIELD: &str = "type";

/// Returns `true` if the given content type is reserved for system entries.
pub fn is_system_type(content_type: &str) -> bool {
    SYSTEM_TYPES.contains(&content_type)
}

/// Open-ended JSON object with a mandatory string `type` field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Content(Map<String, Value>);

impl Content {
    pub fn new(content_type: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(TYPE_FIELD.to_string(), Value::String(content_type.into()));
        Self(fields)
    }

    /// Build content from a type and a payload object.
    ///
    /// Non-object payloads are stored under a `payload` field. A `type` field inside the payload
    /// is ignored.
    pub fn with_payload(content_type: impl Into<String>, payload: Value) -> Self {
        let mut content = Self::new(content_type);
        match payload {
            Value::Object(fields) => {
                for (field, value) in fields {
                    content = content.with(&field, value);
                }
            }
            Value::Null => (),
            value => content = content.with("payload", value),
        }
        content
    }

    /// Set a field. The `type` field can't be overwritten.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        if field != TYPE_FIELD {
            self.0.insert(field.to_string(), value.into());
        }
        self
    }

    pub fn content_type(&self) -> &str {
        self.0
            .get(TYPE_FIELD)
            .and_then(Value::as_str)
            .expect("content always holds a string type field")
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn is_system(&self) -> bool {
        is_system_type(self.content_type())
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl TryFrom<Map<String, Value>> for Content {
    type Error = ValidationError;

    fn try_from(fields: Map<String, Value>) -> Result<Self, Self::Error> {
        match fields.get(TYPE_FIELD) {
            Some(Value::String(_)) => Ok(Self(fields)),
            _ => Err(ValidationError::MissingType),
        }
    }
}

impl TryFrom<Value> for Content {
    type Error = ValidationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => fields.try_into(),
            _ => Err(ValidationError::MissingType),
        }
    }
}

impl From<Content> for Map<String, Value> {
    fn from(content: Content) -> Self {
        content.0
    }
}

impl From<Content> for Value {
    fn from(content: Content) -> Self {
        Value::Object(content.0)
    }
}

/// Options passed along with a subscription, kept verbatim in the subscribe entry.
///
/// Only `alias` is interpreted by the node, all other fields are passed through to listeners.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscribeOptions(Map<String, Value>);

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.0.insert("alias".to_string(), Value::String(alias.into()));
        self
    }

    /// The alias to register this subscription under, if it is a non-empty string.
    pub fn alias(&self) -> Option<&str> {
        self.0
            .get("alias")
            .and_then(Value::as_str)
            .filter(|alias| !alias.is_empty())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn object_or_empty<'de, D>(deserializer: D) -> Result<SubscribeOptions, D::Error>
where
    D: serde::Deserializer<'de>,
{
    // The original JSON clients wrote `null` for missing options.
    match Value::deserialize(deserializer)? {
        Value::Object(fields) => Ok(SubscribeOptions(fields)),
        Value::Null => Ok(SubscribeOptions::default()),
        _ => Err(serde::de::Error::custom("subscribe options need to be an object")),
    }
}

/// Content of entries interpreted by the control plane.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum SystemContent {
    #[serde(rename = "%subscribe")]
    Subscribe {
        #[serde(rename = "feedKey")]
        feed_key: FeedKey,
        #[serde(default = "empty_object")]
        details: Value,
        #[serde(default, deserialize_with = "object_or_empty")]
        options: SubscribeOptions,
    },

    #[serde(rename = "%unsubscribe")]
    Unsubscribe {
        #[serde(rename = "feedKey")]
        feed_key: FeedKey,
    },

    #[serde(rename = "%grant")]
    Grant {
        #[serde(rename = "feedKey")]
        feed_key: FeedKey,
        #[serde(rename = "contentValidationSchema", default = "empty_object")]
        content_validation_schema: Value,
    },

    #[serde(rename = "%revoke")]
    Revoke {
        #[serde(rename = "feedKey")]
        feed_key: FeedKey,
    },

    #[serde(rename = "%remoteauthor")]
    RemoteAuthor {
        #[serde(rename = "remoteContent")]
        remote_content: Content,
    },
}

impl SystemContent {
    pub fn subscribe(feed_key: FeedKey, details: Value, options: SubscribeOptions) -> Self {
        Self::Subscribe {
            feed_key,
            details,
            options,
        }
    }

    pub fn unsubscribe(feed_key: FeedKey) -> Self {
        Self::Unsubscribe { feed_key }
    }

    /// Grant with the default "accept anything" schema when none is given.
    pub fn grant(feed_key: FeedKey, schema: Option<Value>) -> Self {
        Self::Grant {
            feed_key,
            content_validation_schema: schema.unwrap_or_else(empty_object),
        }
    }

    pub fn revoke(feed_key: FeedKey) -> Self {
        Self::Revoke { feed_key }
    }

    pub fn remote_author(remote_content: Content) -> Self {
        Self::RemoteAuthor { remote_content }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            SystemContent::Subscribe { .. } => SUBSCRIBE,
            SystemContent::Unsubscribe { .. } => UNSUBSCRIBE,
            SystemContent::Grant { .. } => GRANT,
            SystemContent::Revoke { .. } => REVOKE,
            SystemContent::RemoteAuthor { .. } => REMOTE_AUTHOR,
        }
    }

    /// The feed this entry refers to, if any.
    pub fn feed_key(&self) -> Option<&FeedKey> {
        match self {
            SystemContent::Subscribe { feed_key, .. }
            | SystemContent::Unsubscribe { feed_key }
            | SystemContent::Grant { feed_key, .. }
            | SystemContent::Revoke { feed_key } => Some(feed_key),
            SystemContent::RemoteAuthor { .. } => None,
        }
    }
}

impl TryFrom<&Content> for SystemContent {
    type Error = ValidationError;

    fn try_from(content: &Content) -> Result<Self, Self::Error> {
        let content_type = content.content_type();
        if !is_system_type(content_type) {
            return Err(ValidationError::InvalidSystemContent {
                content_type: content_type.to_string(),
                reason: "not a system content type".to_string(),
            });
        }

        serde_json::from_value(content.to_value()).map_err(|err| {
            ValidationError::InvalidSystemContent {
                content_type: content_type.to_string(),
                reason: err.to_string(),
            }
        })
    }
}

impl From<SystemContent> for Content {
    fn from(system: SystemContent) -> Self {
        let content = Content::new(system.content_type());
        match system {
            SystemContent::Subscribe {
                feed_key,
                details,
                options,
            } => content
                .with("feedKey", feed_key.as_str())
                .with("details", details)
                .with("options", options.to_value()),
            SystemContent::Unsubscribe { feed_key } | SystemContent::Revoke { feed_key } => {
                content.with("feedKey", feed_key.as_str())
            }
            SystemContent::Grant {
                feed_key,
                content_validation_schema,
            } => content
                .with("feedKey", feed_key.as_str())
                .with("contentValidationSchema", content_validation_schema),
            SystemContent::RemoteAuthor { remote_content } => {
                content.with("remoteContent", remote_content.to_value())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use crate::entry::ValidationError;
    use crate::identity::PrivateKey;

    use super::{Content, SubscribeOptions, SystemContent};

    #[test]
    fn content_requires_type() {
        let content: Content = json!({ "type": "HELLO", "msg": "hi" }).try_into().unwrap();
        assert_eq!(content.content_type(), "HELLO");
        assert_eq!(content.get("msg"), Some(&json!("hi")));
        assert!(!content.is_system());

        assert_matches!(
            Content::try_from(json!({ "msg": "hi" })),
            Err(ValidationError::MissingType)
        );
        assert_matches!(
            Content::try_from(json!({ "type": 12 })),
            Err(ValidationError::MissingType)
        );
        assert_matches!(
            serde_json::from_value::<Content>(json!({ "msg": "hi" })),
            Err(_)
        );
    }

    #[test]
    fn type_field_is_not_overwritten() {
        let content = Content::with_payload("HELLO", json!({ "type": "OTHER", "n": 1 }));
        assert_eq!(content.to_value(), json!({ "type": "HELLO", "n": 1 }));

        let content = Content::with_payload("HELLO", json!(42));
        assert_eq!(content.to_value(), json!({ "type": "HELLO", "payload": 42 }));
    }

    #[test]
    fn subscribe_content_shape() {
        let feed_key = PrivateKey::new().public_key();
        let content: Content =
            SystemContent::subscribe(feed_key.clone(), json!({}), SubscribeOptions::new()).into();

        assert_eq!(
            content.to_value(),
            json!({
                "type": "%subscribe",
                "feedKey": feed_key.as_str(),
                "details": {},
                "options": {},
            })
        );
        assert!(content.is_system());

        let parsed = SystemContent::try_from(&content).unwrap();
        assert_eq!(parsed.feed_key(), Some(&feed_key));
    }

    #[test]
    fn parse_system_content() {
        let feed_key = PrivateKey::new().public_key();

        // Missing details and options fall back to empty objects.
        let content: Content = json!({
            "type": "%subscribe",
            "feedKey": feed_key.as_str(),
            "options": null,
        })
        .try_into()
        .unwrap();
        assert_eq!(
            SystemContent::try_from(&content).unwrap(),
            SystemContent::subscribe(feed_key.clone(), json!({}), SubscribeOptions::new())
        );

        // Grants default to the "accept anything" schema.
        let content: Content = json!({ "type": "%grant", "feedKey": feed_key.as_str() })
            .try_into()
            .unwrap();
        assert_eq!(
            SystemContent::try_from(&content).unwrap(),
            SystemContent::grant(feed_key.clone(), None)
        );

        let content: Content = json!({ "type": "%unsubscribe", "feedKey": "XYZ" })
            .try_into()
            .unwrap();
        assert_matches!(
            SystemContent::try_from(&content),
            Err(ValidationError::InvalidSystemContent { .. })
        );

        let content: Content = json!({ "type": "%remoteauthor", "remoteContent": { "no": 1 } })
            .try_into()
            .unwrap();
        assert!(SystemContent::try_from(&content).is_err());

        let content = Content::new("HELLO");
        assert!(SystemContent::try_from(&content).is_err());
    }

    #[test]
    fn alias_needs_to_be_non_empty_string() {
        assert_eq!(SubscribeOptions::new().with_alias("x").alias(), Some("x"));
        assert_eq!(SubscribeOptions::new().with_alias("").alias(), None);

        let options: SubscribeOptions = serde_json::from_value(json!({ "alias": 5 })).unwrap();
        assert_eq!(options.alias(), None);
        assert_eq!(options.get("alias"), Some(&json!(5)));
    }
}
