//! Startup reconciliation: decide where ingestion resumes.
//!
//! Three inputs go into the decision: the persisted network height `D`, the
//! operator-configured start height `H`, and the live chain tip `T`.
//!
//! | `D`  | `H`  | outcome                                        |
//! |------|------|------------------------------------------------|
//! | none | none | resume after `T - 1` (follow the tip)          |
//! | none | set  | resume after `H - 1`                           |
//! | set  | none | resume after `D`                               |
//! | set  | set  | `H > D + 1`: conflict, ask the operator        |
//! | set  | set  | otherwise: resume after `D` (`H` is ignored)   |
//!
//! A confirmed conflict wipes every aggregate and publishes `Cleared`; the
//! router then runs initialization again against the now-empty store.

use async_trait::async_trait;
use std::sync::Arc;

use crate::bus::EventBus;
use crate::error::SyncError;
use crate::network::{Network, NetworkCommit};
use crate::rehydrate::Rehydrator;
use crate::source::{BlockSource, ConfirmPrompt};
use crate::store::EventStore;
use crate::types::fmt_height;

/// Where ingestion should resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDecision {
    /// Resume after this height (`None` = from genesis).
    Resume(Option<u64>),
    /// The configured start lies past the persisted data; resuming would leave a gap.
    Conflict { configured: u64, persisted: u64 },
}

/// Pure startup decision table.
pub fn resolve_start_height(
    persisted: Option<u64>,
    configured: Option<u64>,
    tip: u64,
) -> StartDecision {
    match (persisted, configured) {
        (None, None) => StartDecision::Resume(tip.checked_sub(1)),
        (None, Some(h)) => StartDecision::Resume(h.checked_sub(1)),
        (Some(d), None) => StartDecision::Resume(Some(d)),
        (Some(d), Some(h)) if h.saturating_sub(1) > d => StartDecision::Conflict {
            configured: h,
            persisted: d,
        },
        (Some(d), Some(_)) => StartDecision::Resume(Some(d)),
    }
}

/// Result of a successful initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// `Initialized` was committed; blocks flow after `height`.
    Initialized { height: Option<u64> },
    /// The operator confirmed a reset; `Cleared` was published.
    Cleared,
}

/// Something that can (re)initialize the network. Called by the saga router on `Cleared`.
#[async_trait]
pub trait Initializer: Send + Sync {
    async fn initialize(&self, request_id: &str) -> Result<InitOutcome, SyncError>;
}

pub struct StartupReconciler {
    rehydrator: Rehydrator,
    store: Arc<dyn EventStore>,
    source: Arc<dyn BlockSource>,
    prompt: Arc<dyn ConfirmPrompt>,
    bus: EventBus,
    start_height: Option<u64>,
}

impl StartupReconciler {
    pub fn new(
        rehydrator: Rehydrator,
        store: Arc<dyn EventStore>,
        source: Arc<dyn BlockSource>,
        prompt: Arc<dyn ConfirmPrompt>,
        bus: EventBus,
    ) -> Self {
        Self {
            rehydrator,
            store,
            source,
            prompt,
            bus,
            start_height: None,
        }
    }

    /// Operator-configured first block to ingest.
    pub fn with_start_height(mut self, height: Option<u64>) -> Self {
        self.start_height = height;
        self
    }

    async fn commit_init(
        &self,
        mut network: Network,
        request_id: &str,
        height: Option<u64>,
        tip: u64,
    ) -> Result<InitOutcome, SyncError> {
        network.init(request_id, height);
        let NetworkCommit { commit, events } = network
            .take_commit()?
            .ok_or_else(|| SyncError::Other("initialization recorded no event".into()))?;
        self.store.append(vec![commit]).await?;
        self.bus.publish_all(events);

        tracing::info!(
            request_id,
            last_indexed = %fmt_height(height),
            next = height.map_or(0, |h| h + 1),
            tip,
            "Network initialized"
        );
        Ok(InitOutcome::Initialized { height })
    }

    /// Truncate every aggregate, the network included, and announce `Cleared`.
    async fn reset(&self, mut network: Network, request_id: &str) -> Result<InitOutcome, SyncError> {
        let mut ids = self.rehydrator.registry().aggregate_ids().to_vec();
        ids.push(self.rehydrator.network_id().to_string());
        self.store.rollback(&ids, None, Vec::new()).await?;

        let event = network.clear(request_id);
        self.bus.publish(event);
        tracing::warn!(request_id, aggregates = ids.len(), "All data cleared");
        Ok(InitOutcome::Cleared)
    }
}

#[async_trait]
impl Initializer for StartupReconciler {
    async fn initialize(&self, request_id: &str) -> Result<InitOutcome, SyncError> {
        let tip = self.source.tip_height().await?;
        let network = self.rehydrator.network().await?;
        let persisted = network.last_block_height();

        match resolve_start_height(persisted, self.start_height, tip) {
            StartDecision::Resume(height) => self.commit_init(network, request_id, height, tip).await,
            StartDecision::Conflict {
                configured,
                persisted,
            } => {
                tracing::warn!(
                    request_id,
                    configured,
                    persisted,
                    "Configured start height is past the persisted data"
                );
                if !self.prompt.confirm_reset(configured, persisted) {
                    return Err(SyncError::Cancelled {
                        reason: format!(
                            "start height {configured} conflicts with persisted height {persisted}"
                        ),
                    });
                }
                self.reset(network, request_id).await
            }
        }
    }
}
