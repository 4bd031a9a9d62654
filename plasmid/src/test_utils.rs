// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use tokio::sync::broadcast;

use crate::NodeEvent;

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Wait for the first event matching the predicate, skipping all others.
///
/// Panics if no such event arrives within five seconds.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<NodeEvent>,
    predicate: F,
) -> NodeEvent
where
    F: Fn(&NodeEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };

    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for event")
}
