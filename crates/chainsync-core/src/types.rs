//! Shared types for the ingestion pipeline.

use serde::{Deserialize, Serialize};

// ─── Block ────────────────────────────────────────────────────────────────────

/// A block record as delivered by the fetch pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block height.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
    /// Number of transactions in the block.
    pub tx_count: u32,
    /// Chain-specific block body, opaque to the core.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub body: serde_json::Value,
}

impl Block {
    pub fn new(number: u64, hash: impl Into<String>, parent_hash: impl Into<String>) -> Self {
        Self {
            number,
            hash: hash.into(),
            parent_hash: parent_hash.into(),
            timestamp: 0,
            tx_count: 0,
            body: serde_json::Value::Null,
        }
    }

    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &Block) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── BlockBatch ───────────────────────────────────────────────────────────────

/// An ordered run of blocks submitted for ingestion as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockBatch {
    /// Identifier used for idempotency and tracing.
    pub request_id: String,
    pub blocks: Vec<Block>,
}

impl BlockBatch {
    pub fn new(request_id: impl Into<String>, blocks: Vec<Block>) -> Self {
        Self {
            request_id: request_id.into(),
            blocks,
        }
    }

    /// Height of the first block, if any.
    pub fn first_height(&self) -> Option<u64> {
        self.blocks.first().map(|b| b.number)
    }

    /// Height of the last block, if any.
    pub fn last_height(&self) -> Option<u64> {
        self.blocks.last().map(|b| b.number)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total transactions across the batch.
    pub fn tx_count(&self) -> u64 {
        self.blocks.iter().map(|b| b.tx_count as u64).sum()
    }
}

/// Renders an optional height, `-` for the empty chain.
pub fn fmt_height(height: Option<u64>) -> String {
    height.map_or_else(|| "-".to_string(), |h| h.to_string())
}

// ─── Tests ────────────────────────────────────────────────────────────────────
