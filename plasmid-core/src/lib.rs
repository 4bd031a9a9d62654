// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core data types of plasmid feeds.
//!
//! A feed is an append-only log of [`Entry`] values with exactly one writer, identified by a
//! [`FeedKey`]. Entries carry open-ended JSON [`Content`]; a small set of reserved
//! [`SystemContent`] types turn a feed into the control plane of its owning node (subscriptions
//! to other feeds and capabilities granted to them).
//!
//! This crate only defines the data types and their validation, it does not persist or
//! replicate anything.
pub mod content;
pub mod entry;
pub mod identity;
pub mod schema;
mod serde;
pub mod topic;

pub use content::{Content, SubscribeOptions, SystemContent, is_system_type};
pub use entry::{Entry, ValidationError, entry_schema, now, validate_entry};
pub use identity::{FeedKey, FeedKeyError, IdentityError, PrivateKey, Signature};
pub use schema::{Validation, validate};
pub use topic::Topic;
