//! Reorg recovery — bring the network and every read model back into
//! agreement at one height after a fork signal.
//!
//! Procedure:
//! 1. The network runs its own backward walk, seeded with its current height.
//! 2. The network's height *after* the walk is the rollback target; the walk
//!    may have gone deeper than the height where the fork was noticed.
//! 3. One store operation truncates every read model above the target and
//!    commits the network's `Reorganized` event.
//! 4. The `Reorganized` event is published so the router can rewind the pipeline.
//!    Model snapshots above the target go with the truncated events.
//!
//! Read-model instances are never passed in: whatever was in memory may
//! reflect invalid blocks, so the next unit of work rehydrates from scratch.
//! Running recovery again recomputes the target from the store, so repeated
//! invocations converge on the same height.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::error::SyncError;
use crate::network::{Network, NetworkCommit};
use crate::rehydrate::Rehydrator;
use crate::source::BlockSource;
use crate::store::EventStore;
use crate::types::fmt_height;

pub struct ReorgRecovery {
    rehydrator: Rehydrator,
    store: Arc<dyn EventStore>,
    source: Arc<dyn BlockSource>,
    bus: EventBus,
}

impl ReorgRecovery {
    pub fn new(
        rehydrator: Rehydrator,
        store: Arc<dyn EventStore>,
        source: Arc<dyn BlockSource>,
        bus: EventBus,
    ) -> Self {
        Self {
            rehydrator,
            store,
            source,
            bus,
        }
    }

    /// Rehydrate the network and recover from its durable state.
    pub async fn recover(&self, request_id: &str) -> Result<Option<u64>, SyncError> {
        let network = self.rehydrator.network().await?;
        self.recover_from(network, request_id).await
    }

    /// Recover starting from an already rehydrated, unmodified network.
    ///
    /// Returns the height every aggregate now agrees on.
    pub async fn recover_from(
        &self,
        mut network: Network,
        request_id: &str,
    ) -> Result<Option<u64>, SyncError> {
        let seed = network.last_block_height();
        let from = network.version();
        network
            .reorganise(request_id, seed, self.source.as_ref())
            .await?;

        let target = network.last_block_height();

        let NetworkCommit { commit, events } = network
            .take_commit()?
            .ok_or_else(|| SyncError::Other("reorganisation recorded no event".into()))?;

        let model_ids = self.rehydrator.registry().aggregate_ids().to_vec();
        self.store.rollback(&model_ids, target, vec![commit]).await?;
        self.bus.publish_all(events);

        if self.rehydrator.snapshot_due(from, network.version()) {
            match network.snapshot() {
                Ok(snapshot) => self.rehydrator.save_snapshots(vec![snapshot]).await,
                Err(e) => tracing::warn!(request_id, error = %e, "Network snapshot skipped"),
            }
        }

        tracing::info!(
            request_id,
            seed = %fmt_height(seed),
            height = %fmt_height(target),
            models = model_ids.len(),
            "Blocks successfully reorganised"
        );
        Ok(target)
    }
}
