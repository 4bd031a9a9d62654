// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command line interface to inspect and control a node persisted on disk.
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use plasmid::{Node, NodeEvent, ReadOptions};
use plasmid_core::{FeedKey, SubscribeOptions};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

pub fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Directory the node keeps its feeds in.
    #[arg(short = 's', long, value_name = "DIR", default_value = "plasmid-data")]
    storage: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the feed key and everything derived from the feed.
    Info,

    /// Subscribe to a foreign feed.
    Subscribe {
        feed_key: FeedKey,

        /// Also publish data of this feed under the given alias.
        #[arg(short = 'a', long)]
        alias: Option<String>,

        /// Details passed along with every event of this subscription.
        #[arg(short = 'd', long, value_parser = parse_json, default_value = "{}")]
        details: Value,
    },

    Unsubscribe {
        feed_key: FeedKey,
    },

    /// Allow a feed to append content to this feed.
    Grant {
        feed_key: FeedKey,

        /// JSON schema the relayed content needs to match.
        #[arg(long, value_parser = parse_json)]
        schema: Option<Value>,
    },

    Revoke {
        feed_key: FeedKey,
    },

    /// Append application content.
    Append {
        content_type: String,

        #[arg(value_parser = parse_json, default_value = "{}")]
        payload: Value,
    },

    /// Print all entries of the own feed or a subscribed feed as JSON lines.
    Log {
        #[arg(short = 'f', long)]
        feed: Option<FeedKey>,
    },

    /// Print node events until interrupted.
    Tail,
}

fn parse_json(value: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(value)
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let args = Args::parse();
    let node = Node::open(&args.storage).await?;
    node.caught_up().await?;

    match args.command {
        Command::Info => info(&node)?,
        Command::Subscribe {
            feed_key,
            alias,
            details,
        } => {
            let mut options = SubscribeOptions::new();
            if let Some(alias) = alias {
                options = options.with_alias(alias);
            }
            print_json(&node.subscribe(&feed_key, details, options).await?.to_value());
        }
        Command::Unsubscribe { feed_key } => {
            print_json(&node.unsubscribe(&feed_key).await?.to_value());
        }
        Command::Grant { feed_key, schema } => {
            print_json(&node.grant(&feed_key, schema).await?.to_value());
        }
        Command::Revoke { feed_key } => {
            print_json(&node.revoke(&feed_key).await?.to_value());
        }
        Command::Append {
            content_type,
            payload,
        } => {
            print_json(&node.append_content(&content_type, payload).await?.to_value());
        }
        Command::Log { feed } => {
            let mut entries = Box::pin(node.read_stream(feed.as_ref(), ReadOptions::default())?);
            while let Some(entry) = entries.next().await {
                print_json(&entry.to_value());
            }
        }
        Command::Tail => tail(&node).await,
    }

    node.close().await?;

    Ok(())
}

fn info(node: &Node) -> Result<()> {
    let subscriptions = serde_json::to_value(node.subscriptions())?;

    let aliases: serde_json::Map<String, Value> = node
        .aliases()
        .into_iter()
        .map(|(alias, feed_key)| (alias, Value::String(feed_key.to_string())))
        .collect();

    let capabilities: serde_json::Map<String, Value> = node
        .capabilities()
        .into_iter()
        .map(|(feed_key, schema)| (feed_key.to_string(), schema))
        .collect();

    print_json(&json!({
        "feedKey": node.feed_key().as_str(),
        "length": node.len(),
        "subscriptions": subscriptions,
        "aliases": aliases,
        "capabilities": capabilities,
    }));

    Ok(())
}

async fn tail(node: &Node) {
    let mut events = node.events();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let event = tokio::select! {
            _ = &mut ctrl_c => break,
            event = events.recv() => match event {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "missed events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        };

        match event {
            NodeEvent::Ready => println!("ready"),
            NodeEvent::AuthoredEntry(entry) => {
                println!("authored {}", entry.to_value());
            }
            NodeEvent::Subscribed { key, .. } => println!("subscribed {key}"),
            NodeEvent::Unsubscribed { key } => println!("unsubscribed {key}"),
            NodeEvent::NewData { key, entry, .. } => {
                println!("data {key} {}", entry.to_value());
            }
            NodeEvent::Grant { feed_key } => println!("grant {feed_key}"),
            NodeEvent::Revoke { feed_key } => println!("revoke {feed_key}"),
        }
    }
}

fn print_json(value: &Value) {
    println!("{value}");
}
