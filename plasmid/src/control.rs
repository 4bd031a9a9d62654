// SPDX-License-Identifier: MIT OR Apache-2.0

//! Control loop of a node.
//!
//! The loop reads the own feed from the first entry on and keeps tailing it. Every entry is
//! published as [`NodeEvent::AuthoredEntry`] and then classified: grants and revokes update the
//! capabilities, subscribes and unsubscribes open and close subscriptions. All other entries carry
//! no control information.
//!
//! Since all state is derived from the feed, replaying it after a restart restores the exact same
//! subscriptions, aliases and capabilities.
use std::sync::Arc;

use futures_util::StreamExt;
use plasmid_core::{Entry, SystemContent};
use plasmid_store::ReadOptions;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::context::NodeContext;
use crate::events::NodeEvent;
use crate::subscriptions;

pub(crate) async fn run(context: Arc<NodeContext>, processed: watch::Sender<u64>) {
    let mut entries = Box::pin(context.feed.read_stream(ReadOptions::live()));

    if context.replay_length == 0 {
        context.emit(NodeEvent::Ready);
    }

    loop {
        let entry = tokio::select! {
            biased;
            _ = context.shutdown.cancelled() => break,
            entry = entries.next() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };

        let index = entry.sequence;
        dispatch(&context, entry).await;
        processed.send_replace(index + 1);

        if index + 1 == context.replay_length {
            debug!(feed = %context.feed.key(), entries = index + 1, "replayed own feed");
            context.emit(NodeEvent::Ready);
        }
    }

    debug!(feed = %context.feed.key(), "stop control loop");
}

async fn dispatch(context: &Arc<NodeContext>, entry: Entry) {
    context.emit(NodeEvent::AuthoredEntry(entry.clone()));

    if let (Some(remote_author), Some(remote_sequence)) =
        (&entry.remote_author, entry.remote_sequence)
    {
        context
            .write_state()
            .mark_relayed(remote_author, remote_sequence);
    }

    let system = match entry.system_content() {
        Some(Ok(system)) => system,
        Some(Err(err)) => {
            // The write hook rejects these, only entries from older storage can end up here.
            warn!(sequence = entry.sequence, "ignore malformed system entry: {err}");
            return;
        }
        None => return,
    };

    match system {
        SystemContent::Grant {
            feed_key,
            content_validation_schema,
        } => {
            debug!(feed = %feed_key, "grant capability");
            context
                .write_state()
                .capabilities
                .grant(feed_key.clone(), content_validation_schema);
            context.emit(NodeEvent::Grant { feed_key });
        }
        SystemContent::Revoke { feed_key } => {
            debug!(feed = %feed_key, "revoke capability");
            context.write_state().capabilities.revoke(&feed_key);
            context.emit(NodeEvent::Revoke { feed_key });
        }
        SystemContent::Subscribe {
            feed_key,
            details,
            options,
        } => {
            subscriptions::open(
                context,
                entry.sequence,
                feed_key,
                details,
                options,
                entry.timestamp,
            )
            .await;
        }
        SystemContent::Unsubscribe { feed_key } => {
            subscriptions::close(context, &feed_key).await;
        }
        // Only requests on subscribed feeds are acted upon.
        SystemContent::RemoteAuthor { .. } => (),
    }
}
