//! Batch ingestion — apply one ordered batch to the network and every read
//! model, then commit all of it atomically, or hand off to recovery.
//!
//! # Per batch
//! 1. Rehydrate the network and fresh read-model instances.
//! 2. Extend the network; a fork signal hands control to [`ReorgRecovery`].
//! 3. Feed every block, in order, to every model.
//! 4. Append all dirty models plus the network in one store commit.
//! 5. Publish the network's events (the router acknowledges the blocks).
//! 6. Snapshot every aggregate whose version crossed the snapshot interval.
//!
//! Any other error is returned unchanged with nothing written; the pipeline
//! is expected to redeliver the batch.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::error::SyncError;
use crate::metrics::{SyncMetrics, EVENTSTORE_SAVE, PARSE_BLOCK, RESTORE_MODELS};
use crate::model::ModelInstance;
use crate::network::{Network, NetworkCommit};
use crate::recovery::ReorgRecovery;
use crate::rehydrate::Rehydrator;
use crate::store::EventStore;
use crate::types::{fmt_height, BlockBatch};

/// What happened to a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The batch was committed; the network is now at `height`.
    Committed { height: u64, blocks: usize },
    /// A fork was found and recovered from; nothing from the batch was committed.
    Reorganized { height: Option<u64> },
    /// The batch was empty.
    Skipped,
}

/// The ingestion orchestrator. Holds no aggregate state between calls.
pub struct BatchIngestor {
    rehydrator: Rehydrator,
    store: Arc<dyn EventStore>,
    recovery: Arc<ReorgRecovery>,
    bus: EventBus,
    metrics: SyncMetrics,
    max_block_height: Option<u64>,
}

impl BatchIngestor {
    pub fn new(
        rehydrator: Rehydrator,
        store: Arc<dyn EventStore>,
        recovery: Arc<ReorgRecovery>,
        bus: EventBus,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            rehydrator,
            store,
            recovery,
            bus,
            metrics,
            max_block_height: None,
        }
    }

    /// Reject batches reaching above `height`.
    pub fn with_max_block_height(mut self, height: Option<u64>) -> Self {
        self.max_block_height = height;
        self
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    /// Ingest one batch. Must not run concurrently with another call for the same network.
    pub async fn handle_batch(&self, batch: &BlockBatch) -> Result<BatchOutcome, SyncError> {
        let request_id = batch.request_id.as_str();
        let from = fmt_height(batch.first_height());
        let to = fmt_height(batch.last_height());

        match self.ingest(batch).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(request_id, %from, %to, error = %e, "Error while loading blocks");
                Err(e)
            }
        }
    }

    async fn ingest(&self, batch: &BlockBatch) -> Result<BatchOutcome, SyncError> {
        let request_id = batch.request_id.as_str();
        let Some(last_height) = batch.last_height() else {
            tracing::warn!(request_id, "Empty batch skipped");
            return Ok(BatchOutcome::Skipped);
        };
        if let Some(max) = self.max_block_height {
            if last_height > max {
                return Err(SyncError::Config(format!(
                    "batch reaches block {last_height}, above max block height {max}"
                )));
            }
        }

        let (mut network, mut models) = futures::try_join!(
            self.rehydrator.network(),
            self.metrics.track(RESTORE_MODELS, self.rehydrator.models()),
        )?;

        let network_from = network.version();
        if let Err(e) = network.add_blocks(request_id, &batch.blocks) {
            if !e.is_fork() {
                return Err(e);
            }
            tracing::warn!(
                request_id,
                error = %e,
                network_height = %fmt_height(network.last_block_height()),
                "Fork detected, reorganising"
            );
            drop(models);
            let height = self.recovery.recover_from(network, request_id).await?;
            self.metrics.record_reorg();
            return Ok(BatchOutcome::Reorganized { height });
        }

        let models_from: Vec<u64> = models.iter().map(ModelInstance::version).collect();
        for block in &batch.blocks {
            self.metrics
                .track(PARSE_BLOCK, async {
                    for model in models.iter_mut() {
                        model.parse_block(block, request_id).await?;
                    }
                    Ok::<(), SyncError>(())
                })
                .await?;
        }

        let mut commits: Vec<_> = models
            .iter_mut()
            .filter_map(ModelInstance::take_commit)
            .collect();
        let NetworkCommit { commit, events } = network
            .take_commit()?
            .ok_or_else(|| SyncError::Other("network recorded no event for the batch".into()))?;
        commits.push(commit);

        let dirty = commits.len() - 1;
        self.metrics
            .track(EVENTSTORE_SAVE, self.store.append(commits))
            .await?;
        self.metrics.record_blocks(batch.len());
        self.bus.publish_all(events);
        self.snapshot(&network, network_from, &models, &models_from).await;

        tracing::info!(request_id, blocks_height = last_height, "Blocks successfully loaded");
        tracing::debug!(
            request_id,
            blocks_height = last_height,
            blocks_length = batch.len(),
            tx_length = batch.tx_count(),
            models_changed = dirty,
            restore_models_ms = self.metrics.total_ms(RESTORE_MODELS),
            parse_block_ms = self.metrics.total_ms(PARSE_BLOCK),
            eventstore_save_ms = self.metrics.total_ms(EVENTSTORE_SAVE),
            "Batch stats"
        );

        Ok(BatchOutcome::Committed {
            height: last_height,
            blocks: batch.len(),
        })
    }

    /// Save snapshots of committed aggregates that crossed an interval boundary.
    async fn snapshot(
        &self,
        network: &Network,
        network_from: u64,
        models: &[ModelInstance],
        models_from: &[u64],
    ) {
        let mut snapshots = Vec::new();
        if self.rehydrator.snapshot_due(network_from, network.version()) {
            match network.snapshot() {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => tracing::warn!(error = %e, "Network snapshot skipped"),
            }
        }
        for (model, from) in models.iter().zip(models_from) {
            if self.rehydrator.snapshot_due(*from, model.version()) {
                snapshots.extend(model.snapshot());
            }
        }
        if !snapshots.is_empty() {
            self.rehydrator.save_snapshots(snapshots).await;
        }
    }
}
