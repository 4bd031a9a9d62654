// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lifecycle of subscriptions to foreign feeds.
//!
//! Every subscription owns a read-only mirror of the foreign feed and a listener task tailing it.
//! The listener publishes new entries under the feed key and all aliases bound to it, and relays
//! remote author requests for which a capability was granted. Requests are judged once, when they
//! reach the mirror, so entries persisted before a subscription opens are published but never
//! relayed again.
use std::sync::Arc;

use futures_util::StreamExt;
use plasmid_core::{Entry, FeedKey, SubscribeOptions, SystemContent, now};
use plasmid_store::{Feed, FeedConfig, ReadOptions};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::context::NodeContext;
use crate::events::{EventKey, NodeEvent};

pub(crate) struct Subscription {
    feed: Feed,
    details: Value,
    options: SubscribeOptions,
    low_water_mark: u64,
    listener: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            feed_key: self.feed.key().clone(),
            details: self.details.clone(),
            options: self.options.clone(),
            low_water_mark: self.low_water_mark,
            length: self.feed.len(),
        }
    }

    /// Stop the listener, wait for it to finish and release the feed.
    pub async fn stop(self) {
        self.listener.cancel();

        if let Err(err) = self.handle.await {
            if !err.is_cancelled() {
                error!(feed = %self.feed.key(), "subscription listener failed: {err}");
            }
        }

        if let Err(err) = self.feed.close().await {
            warn!(feed = %self.feed.key(), "could not close subscribed feed: {err}");
        }
    }
}

/// Public view on a subscription.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub feed_key: FeedKey,
    pub details: Value,
    pub options: SubscribeOptions,

    /// Timestamp of the subscribing entry, older entries are not published.
    pub low_water_mark: u64,

    /// Number of entries of the foreign feed known to this node.
    pub length: u64,
}

/// Open a subscription requested by the entry at `index` of the own feed, replacing an existing
/// one for the same feed.
pub(crate) async fn open(
    context: &Arc<NodeContext>,
    index: u64,
    feed_key: FeedKey,
    details: Value,
    options: SubscribeOptions,
    low_water_mark: u64,
) {
    let previous = context.write_state().subscriptions.remove(&feed_key);
    if let Some(previous) = previous {
        debug!(feed = %feed_key, "replace subscription");
        previous.stop().await;
    }

    let config = FeedConfig::foreign(feed_key.clone(), context.subscription_storage(&feed_key));
    let feed = match Feed::open(config).await {
        Ok(feed) => feed,
        Err(err) => {
            error!(feed = %feed_key, "could not open subscribed feed: {err}");
            return;
        }
    };

    // Requests already in the mirror were judged while they arrived.
    let judge_from = feed.len();
    debug!(feed = %feed_key, low_water_mark, judge_from, "subscribe");

    let listener = context.shutdown.child_token();
    let handle = tokio::spawn(listen(
        context.clone(),
        feed.clone(),
        details.clone(),
        index,
        low_water_mark,
        judge_from,
        listener.clone(),
    ));

    let alias = options.alias().map(str::to_string);
    {
        let mut state = context.write_state();
        if let Some(alias) = &alias {
            let previous = state.bind_alias(alias.clone(), feed_key.clone());
            if let Some(previous) = previous.filter(|previous| previous != &feed_key) {
                debug!(alias, from = %previous, to = %feed_key, "rebind alias");
            }
        }

        state.subscriptions.insert(
            feed_key.clone(),
            Subscription {
                feed,
                details: details.clone(),
                options: options.clone(),
                low_water_mark,
                listener,
                handle,
            },
        );
    }

    context.emit(NodeEvent::Subscribed {
        key: EventKey::Feed(feed_key),
        details: details.clone(),
        options: options.clone(),
    });

    if let Some(alias) = alias {
        context.emit(NodeEvent::Subscribed {
            key: EventKey::Alias(alias),
            details,
            options,
        });
    }
}

/// Close the subscription to a feed. Closing an unknown subscription does nothing.
pub(crate) async fn close(context: &NodeContext, feed_key: &FeedKey) {
    let subscription = context.write_state().subscriptions.remove(feed_key);
    let Some(subscription) = subscription else {
        debug!(feed = %feed_key, "unsubscribe from feed which is not subscribed");
        return;
    };

    subscription.stop().await;
    debug!(feed = %feed_key, "unsubscribe");

    context.emit(NodeEvent::Unsubscribed {
        key: EventKey::Feed(feed_key.clone()),
    });

    let aliases = context.write_state().unbind_aliases(feed_key);
    for alias in aliases {
        context.emit(NodeEvent::Unsubscribed {
            key: EventKey::Alias(alias),
        });
    }
}

async fn listen(
    context: Arc<NodeContext>,
    feed: Feed,
    details: Value,
    index: u64,
    low_water_mark: u64,
    judge_from: u64,
    listener: CancellationToken,
) {
    let feed_key = feed.key().clone();

    // Publish nothing before the subscribe entry was fully processed and announced.
    let processed = tokio::select! {
        biased;
        _ = listener.cancelled() => false,
        processed = context.wait_processed(index) => processed,
    };
    if !processed {
        return;
    }

    let mut entries = Box::pin(feed.read_stream(ReadOptions::live()));

    loop {
        let entry = tokio::select! {
            biased;
            _ = listener.cancelled() => break,
            entry = entries.next() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };

        if entry.timestamp < low_water_mark {
            trace!(
                feed = %feed_key,
                sequence = entry.sequence,
                "skip entry older than subscription"
            );
            continue;
        }

        context.emit(NodeEvent::NewData {
            key: EventKey::Feed(feed_key.clone()),
            entry: entry.clone(),
            details: details.clone(),
        });

        let aliases = context.read_state().aliases_for(&feed_key);
        for alias in aliases {
            context.emit(NodeEvent::NewData {
                key: EventKey::Alias(alias),
                entry: entry.clone(),
                details: details.clone(),
            });
        }

        if entry.sequence < judge_from {
            continue;
        }

        // Capabilities and relayed requests are only complete after the own feed got replayed.
        let replayed = tokio::select! {
            biased;
            _ = listener.cancelled() => break,
            replayed = context.wait_replayed() => replayed,
        };
        if !replayed {
            break;
        }

        relay(&context, &entry).await;
    }

    trace!(feed = %feed_key, "stop subscription listener");
}

/// Append the remote content of a remote author request to the own feed, if permitted.
///
/// Requests which are malformed, lack a capability or violate its schema are dropped.
async fn relay(context: &NodeContext, entry: &Entry) {
    let remote_content = match entry.system_content() {
        Some(Ok(SystemContent::RemoteAuthor { remote_content })) => remote_content,
        Some(Err(err)) => {
            debug!(
                feed = %entry.author,
                sequence = entry.sequence,
                "ignore malformed system entry: {err}"
            );
            return;
        }
        _ => return,
    };

    let remote_author = entry.author.clone();
    let remote_sequence = entry.sequence;

    {
        let state = context.read_state();
        if state.is_relayed(&remote_author, remote_sequence) {
            trace!(feed = %remote_author, sequence = remote_sequence, "request was relayed before");
            return;
        }

        if let Err(denied) = state.capabilities.authorize(&remote_author, &remote_content) {
            debug!(
                feed = %remote_author,
                sequence = remote_sequence,
                "drop remote author request: {denied}"
            );
            return;
        }
    }

    let author = context.feed.key().clone();
    let result = context
        .feed
        .append_next(|index| Entry {
            author,
            sequence: index,
            timestamp: now(),
            content: remote_content,
            remote_author: Some(remote_author.clone()),
            remote_sequence: Some(remote_sequence),
        })
        .await;

    match result {
        Ok(relayed) => {
            context.write_state().mark_relayed(&remote_author, remote_sequence);
            debug!(
                feed = %remote_author,
                sequence = remote_sequence,
                index = relayed.sequence,
                "relay remote content"
            );
        }
        Err(err) => {
            debug!(
                feed = %remote_author,
                sequence = remote_sequence,
                "could not relay remote content: {err}"
            );
        }
    }
}
