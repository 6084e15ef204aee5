//! Model rehydrator — loads the latest durable state of the network and of
//! every registered read model before each unit of work.
//!
//! Each aggregate starts from its newest usable snapshot and replays only the
//! events stored after it, so the cost of a rehydration is bounded by the
//! snapshot interval rather than by the length of the chain.

use futures::future::try_join_all;
use std::sync::Arc;

use crate::error::SyncError;
use crate::model::{ModelInstance, ModelRegistry};
use crate::network::Network;
use crate::store::{EventQuery, EventStore, Snapshot, StoredEvent};

/// Rebuilds aggregates from the event store. Holds no aggregate state itself.
#[derive(Clone)]
pub struct Rehydrator {
    store: Arc<dyn EventStore>,
    registry: Arc<ModelRegistry>,
    network_id: String,
    window_size: usize,
    snapshot_interval: u64,
}

impl Rehydrator {
    pub fn new(
        store: Arc<dyn EventStore>,
        registry: Arc<ModelRegistry>,
        network_id: impl Into<String>,
        window_size: usize,
    ) -> Self {
        Self {
            store,
            registry,
            network_id: network_id.into(),
            window_size,
            snapshot_interval: 0,
        }
    }

    /// Snapshot aggregates every `interval` events (`0` = never).
    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// An empty network aggregate with the configured id and window.
    pub fn empty_network(&self) -> Network {
        Network::new(self.network_id.clone(), self.window_size)
    }

    /// Newest snapshot visible at `max_height` and the events stored after it.
    async fn load(
        &self,
        aggregate_id: &str,
        max_height: Option<u64>,
    ) -> Result<(Option<Snapshot>, Vec<StoredEvent>), SyncError> {
        let snapshot = self.store.load_snapshot(aggregate_id, max_height).await?;
        let query = EventQuery {
            aggregate_ids: vec![aggregate_id.to_string()],
            max_height,
            min_version: snapshot.as_ref().map(|s| s.version + 1),
            ..Default::default()
        };
        let events = self.store.fetch_events(&query).await?;
        Ok((snapshot, events))
    }

    /// The network as of its latest stored event.
    pub async fn network(&self) -> Result<Network, SyncError> {
        let (snapshot, events) = self.load(&self.network_id, None).await?;
        let mut network = self.empty_network();
        if let Some(snapshot) = &snapshot {
            network.restore_snapshot(snapshot)?;
        }
        network.replay(&events)?;
        let snapshot_version = snapshot.as_ref().map(|s| s.version);
        tracing::debug!(
            network = %self.network_id,
            version = network.version(),
            height = ?network.last_block_height(),
            snapshot = ?snapshot_version,
            replayed = events.len(),
            "Network rehydrated"
        );
        Ok(network)
    }

    /// The network as of `height` (events above it ignored).
    ///
    /// Network heights move backwards on reorgs, so this replays the filtered
    /// log from the start instead of trusting a snapshot.
    pub async fn network_at(&self, height: u64) -> Result<Network, SyncError> {
        let events = self
            .store
            .fetch_events(&EventQuery::aggregate(self.network_id.clone()).max_height(height))
            .await?;
        let mut network = self.empty_network();
        network.replay(&events)?;
        Ok(network)
    }

    async fn restore_to(
        &self,
        mut instance: ModelInstance,
        max_height: Option<u64>,
    ) -> Result<ModelInstance, SyncError> {
        let (snapshot, events) = self.load(instance.id(), max_height).await?;
        if let Some(snapshot) = &snapshot {
            instance.restore_snapshot(snapshot)?;
        }
        instance.replay(&events)?;
        Ok(instance)
    }

    /// Restore a fresh instance up to its latest stored event.
    pub async fn restore(&self, instance: ModelInstance) -> Result<ModelInstance, SyncError> {
        self.restore_to(instance, None).await
    }

    /// Restore a fresh instance up to `height`.
    pub async fn restore_at(
        &self,
        instance: ModelInstance,
        height: u64,
    ) -> Result<ModelInstance, SyncError> {
        self.restore_to(instance, Some(height)).await
    }

    /// Fresh instances of every registered model, restored concurrently.
    pub async fn models(&self) -> Result<Vec<ModelInstance>, SyncError> {
        try_join_all(self.registry.instantiate().into_iter().map(|inst| self.restore(inst))).await
    }

    /// Returns `true` if going from version `from` to `to` crosses a snapshot boundary.
    pub fn snapshot_due(&self, from: u64, to: u64) -> bool {
        self.snapshot_interval > 0 && from / self.snapshot_interval != to / self.snapshot_interval
    }

    /// Persist `snapshots`. Failures are logged; the events they cover are already stored.
    pub async fn save_snapshots(&self, snapshots: Vec<Snapshot>) {
        for snapshot in snapshots {
            let aggregate_id = snapshot.aggregate_id.clone();
            let version = snapshot.version;
            match self.store.save_snapshot(snapshot).await {
                Ok(()) => tracing::debug!(aggregate_id, version, "Snapshot saved"),
                Err(e) => tracing::warn!(aggregate_id, version, error = %e, "Snapshot not saved"),
            }
        }
    }
}
