// SPDX-License-Identifier: MIT OR Apache-2.0

use std::path::PathBuf;

use plasmid_core::PrivateKey;
use plasmid_store::Storage;

use crate::Node;
use crate::node::{Config, NodeError};

#[derive(Default)]
pub struct NodeBuilder {
    private_key: Option<PrivateKey>,
    config: Config,
}

impl NodeBuilder {
    pub(crate) fn new() -> Self {
        NodeBuilder {
            private_key: None,
            config: Config::default(),
        }
    }

    /// Key of the own feed when creating new storage.
    ///
    /// Storage created earlier keeps using its persisted key, opening it with another key fails.
    pub fn private_key(mut self, private_key: PrivateKey) -> Self {
        self.private_key = Some(private_key);
        self
    }

    /// Persist all feeds in this directory.
    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage = Storage::directory(path);
        self
    }

    /// Keep all feeds in memory.
    pub fn in_memory(mut self) -> Self {
        self.config.storage = Storage::Memory;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub async fn spawn(self) -> Result<Node, NodeError> {
        if self.config.event_capacity == 0 {
            return Err(NodeError::InvalidArgument(
                "event capacity needs to be larger than zero".to_string(),
            ));
        }

        Node::spawn_inner(self.config, self.private_key).await
    }
}
