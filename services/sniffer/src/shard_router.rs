//! Location-to-storage routing.
//!
//! Every watched location has its own storage node, named after the
//! location's leaf directory. The router owns those connections and is
//! only ever touched from the reactor thread.

use crate::observation::Observation;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Node {0} is already attached")]
    DuplicateNode(String),

    #[error("No node attached for location {0}")]
    NoSuchNode(String),

    #[error("Invalid node name {0:?}")]
    InvalidNodeName(String),

    #[error("Failed to connect node {name}: {source}")]
    Connect {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Insert into node {name} failed: {source}")]
    Insert {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Sink for the observations of one location.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Store the whole batch; returns the number of rows written.
    async fn insert(&self, observations: &[Observation]) -> Result<u64, StorageError>;

    async fn close(&self);
}

/// Opens a store for a node.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(
        &self,
        name: &str,
        target: &str,
    ) -> Result<Box<dyn ObservationStore>, StorageError>;
}

/// One attached storage connection.
pub struct ShardNode {
    name: String,
    target: String,
    store: Box<dyn ObservationStore>,
}

impl ShardNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

pub struct ShardRouter {
    connector: Box<dyn StoreConnector>,
    nodes: HashMap<String, ShardNode>,
}

impl ShardRouter {
    pub fn new(connector: Box<dyn StoreConnector>) -> Self {
        Self {
            connector,
            nodes: HashMap::new(),
        }
    }

    /// Connect a node for location `name`.
    #[instrument(skip(self))]
    pub async fn attach(&mut self, name: &str, target: &str) -> Result<(), StorageError> {
        if self.nodes.contains_key(name) {
            return Err(StorageError::DuplicateNode(name.to_string()));
        }

        let store = self.connector.connect(name, target).await?;
        self.nodes.insert(
            name.to_string(),
            ShardNode {
                name: name.to_string(),
                target: target.to_string(),
                store,
            },
        );

        info!(node = %name, "Storage node attached");
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&ShardNode> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Forward a batch to the node of `name` in one operation.
    #[instrument(skip(self, observations), fields(count = observations.len()))]
    pub async fn insert(&self, name: &str, observations: &[Observation]) -> Result<u64, StorageError> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| StorageError::NoSuchNode(name.to_string()))?;

        if observations.is_empty() {
            debug!(node = %name, "Empty batch, nothing to store");
            return Ok(0);
        }

        match node.store.insert(observations).await {
            Ok(stored) => {
                metrics::counter!("sniffer.observations.stored").increment(stored);
                debug!(node = %name, stored, "Batch stored");
                Ok(stored)
            }
            Err(e) => {
                metrics::counter!("sniffer.batches.failed").increment(1);
                warn!(node = %name, error = %e, "Batch insert failed");
                Err(e)
            }
        }
    }

    /// Close every node and forget it.
    pub async fn detach_all(&mut self) {
        for (name, node) in self.nodes.drain() {
            node.store.close().await;
            debug!(node = %name, "Storage node detached");
        }
        info!("All storage nodes detached");
    }
}
