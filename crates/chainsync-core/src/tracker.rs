//! Block window — the recent, verified blocks the network keeps for
//! parent-hash checks and reorg walks.

use std::collections::VecDeque;

use crate::types::Block;

/// Bounded window of the most recent network blocks (oldest first).
#[derive(Debug, Clone)]
pub struct BlockWindow {
    blocks: VecDeque<Block>,
    capacity: usize,
}

impl BlockWindow {
    /// Create an empty window holding at most `capacity` blocks.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            blocks: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append a block, evicting the oldest when full.
    pub fn push(&mut self, block: Block) {
        if self.blocks.len() >= self.capacity {
            self.blocks.pop_front();
        }
        self.blocks.push_back(block);
    }

    /// The most recently added block.
    pub fn head(&self) -> Option<&Block> {
        self.blocks.back()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Discard every block above `block_number`.
    pub fn rewind_to(&mut self, block_number: u64) {
        while matches!(self.blocks.back(), Some(b) if b.number > block_number) {
            self.blocks.pop_back();
        }
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn iter(&self) -> std::collections::vec_deque::Iter<'_, Block> {
        self.blocks.iter()
    }
}
