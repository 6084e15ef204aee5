//! Read-side access to stored events and to rebuilt aggregates.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::SyncError;
use crate::network::Network;
use crate::rehydrate::Rehydrator;
use crate::store::{EventQuery, EventStore, StoredEvent};

/// Point-in-time view of one aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub aggregate_id: String,
    pub version: u64,
    pub block_height: Option<u64>,
    pub state: serde_json::Value,
}

impl ModelSnapshot {
    fn of_network(network: &Network) -> Self {
        Self {
            aggregate_id: network.id().to_string(),
            version: network.version(),
            block_height: network.last_block_height(),
            state: serde_json::json!({
                "last_block_height": network.last_block_height(),
                "window_len": network.window().len(),
                "head": network.window().head().map(|b| b.hash.clone()),
            }),
        }
    }
}

#[derive(Clone)]
pub struct QueryService {
    rehydrator: Rehydrator,
    store: Arc<dyn EventStore>,
}

impl QueryService {
    pub fn new(rehydrator: Rehydrator, store: Arc<dyn EventStore>) -> Self {
        Self { rehydrator, store }
    }

    pub async fn fetch_events(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, SyncError> {
        self.store.fetch_events(query).await
    }

    /// Rebuild `ids` from their events, optionally only up to `height`.
    ///
    /// The network's id is accepted alongside read-model ids.
    pub async fn get_models(
        &self,
        ids: &[String],
        height: Option<u64>,
    ) -> Result<Vec<ModelSnapshot>, SyncError> {
        if ids.is_empty() {
            return Err(SyncError::Other("no model ids requested".into()));
        }
        let registry = self.rehydrator.registry();
        let unknown: Vec<&str> = ids
            .iter()
            .map(String::as_str)
            .filter(|id| {
                *id != self.rehydrator.network_id()
                    && !registry.aggregate_ids().iter().any(|known| known.as_str() == *id)
            })
            .collect();
        if !unknown.is_empty() {
            return Err(SyncError::Other(format!(
                "no models found for: {}",
                unknown.join(", ")
            )));
        }

        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
            if id == self.rehydrator.network_id() {
                let network = match height {
                    Some(h) => self.rehydrator.network_at(h).await?,
                    None => self.rehydrator.network().await?,
                };
                snapshots.push(ModelSnapshot::of_network(&network));
                continue;
            }
            let Some(instance) = registry.instantiate_one(id) else {
                continue;
            };
            let instance = match height {
                Some(h) => self.rehydrator.restore_at(instance, h).await?,
                None => self.rehydrator.restore(instance).await?,
            };
            snapshots.push(ModelSnapshot {
                aggregate_id: instance.id().to_string(),
                version: instance.version(),
                block_height: instance.last_block_height(),
                state: instance.state(),
            });
        }
        Ok(snapshots)
    }
}
