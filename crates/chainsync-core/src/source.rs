//! Collaborator contracts: the blockchain data source, the fetch pipeline,
//! and the operator confirmation prompt.

use async_trait::async_trait;

use crate::error::SyncError;
use crate::types::Block;

/// Read access to the live chain.
///
/// Errors are fatal to the current operation; the core never retries them.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Height of the current chain tip.
    async fn tip_height(&self) -> Result<u64, SyncError>;

    /// The canonical block at `height`, or `None` if the node doesn't have it.
    async fn block_by_height(&self, height: u64) -> Result<Option<Block>, SyncError>;
}

/// Commands accepted by the upstream block fetch/queue pipeline.
///
/// Every command may be delivered more than once and must be idempotent.
#[async_trait]
pub trait FetchPipeline: Send + Sync {
    /// Begin delivering blocks after `height` (`None` = from genesis).
    async fn start(&self, height: Option<u64>) -> Result<(), SyncError>;

    /// Release the given block hashes from the pipeline's backlog.
    async fn confirm(&self, block_hashes: &[String]) -> Result<(), SyncError>;

    /// Drop buffered or in-flight work above `height` and resume after it.
    async fn reorganize(&self, height: Option<u64>) -> Result<(), SyncError>;
}

/// Synchronous yes/no question to the operator, used only at startup.
pub trait ConfirmPrompt: Send + Sync {
    /// Ask whether all data may be wiped to honour `configured` over `persisted`.
    fn confirm_reset(&self, configured: u64, persisted: u64) -> bool;
}

/// Prompt that always gives the same answer (non-interactive runs and tests).
#[derive(Debug, Clone, Copy)]
pub struct FixedPrompt(pub bool);

impl ConfirmPrompt for FixedPrompt {
    fn confirm_reset(&self, configured: u64, persisted: u64) -> bool {
        tracing::warn!(
            configured,
            persisted,
            answer = self.0,
            "Data reset requested; answering non-interactively"
        );
        self.0
    }
}
