//! The network aggregate — canonical chain height and the recent-block window.
//!
//! The network is the single source of truth for "how far have we ingested".
//! It owns two decisions the orchestrator deliberately does not make:
//!
//! 1. **Continuity**: whether a batch chains from the current head
//!    ([`Network::add_blocks`] raises [`SyncError::ForkDetected`] if not).
//! 2. **Rollback depth**: how far back a fork goes ([`Network::reorganise`]
//!    walks the window against the data source until the hashes agree).
//!
//! Like read models it is event-sourced: state is rebuilt by replaying its
//! stored [`NetworkEvent`]s, and every mutation is recorded as a pending event
//! that the caller commits.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::event::NetworkEvent;
use crate::source::BlockSource;
use crate::store::{AggregateCommit, NewEvent, Snapshot, StoredEvent};
use crate::tracker::BlockWindow;
use crate::types::{fmt_height, Block};

/// Pending network events ready for the store, with the events to publish afterwards.
#[derive(Debug)]
pub struct NetworkCommit {
    pub commit: AggregateCommit,
    pub events: Vec<NetworkEvent>,
}

/// Snapshot payload of the network.
#[derive(Debug, Serialize, Deserialize)]
struct NetworkState {
    last_block_height: Option<u64>,
    window: Vec<Block>,
}

/// Event-sourced network state.
#[derive(Debug, Clone)]
pub struct Network {
    id: String,
    window: BlockWindow,
    last_block_height: Option<u64>,
    version: u64,
    pending: Vec<NetworkEvent>,
}

impl Network {
    pub fn new(id: impl Into<String>, window_size: usize) -> Self {
        Self {
            id: id.into(),
            window: BlockWindow::new(window_size),
            last_block_height: None,
            version: 0,
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Last confirmed height, `None` while the chain is empty.
    pub fn last_block_height(&self) -> Option<u64> {
        self.last_block_height
    }

    /// Version including pending events.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn window(&self) -> &BlockWindow {
        &self.window
    }

    pub fn pending_events(&self) -> &[NetworkEvent] {
        &self.pending
    }

    /// Rebuild state from stored events (version order).
    pub fn replay(&mut self, events: &[StoredEvent]) -> Result<(), SyncError> {
        for stored in events {
            let event: NetworkEvent = serde_json::from_value(stored.payload.clone()).map_err(|e| {
                SyncError::Storage(format!("network event v{}: {e}", stored.version))
            })?;
            self.apply(&event);
            self.version = stored.version;
        }
        Ok(())
    }

    /// Restore state from a snapshot; events after it are replayed separately.
    pub fn restore_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), SyncError> {
        let state: NetworkState = serde_json::from_value(snapshot.state.clone()).map_err(|e| {
            SyncError::Storage(format!("network snapshot v{}: {e}", snapshot.version))
        })?;
        self.window.clear();
        for block in state.window {
            self.window.push(block);
        }
        self.last_block_height = state.last_block_height;
        self.version = snapshot.version;
        Ok(())
    }

    /// Snapshot of the committed state. Pending events must be taken first.
    pub fn snapshot(&self) -> Result<Snapshot, SyncError> {
        if !self.pending.is_empty() {
            return Err(SyncError::Other("network has uncommitted events".into()));
        }
        let state = NetworkState {
            last_block_height: self.last_block_height,
            window: self.window.iter().cloned().collect(),
        };
        Ok(Snapshot {
            aggregate_id: self.id.clone(),
            version: self.version,
            block_height: self.last_block_height,
            state: serde_json::to_value(state)?,
        })
    }

    fn apply(&mut self, event: &NetworkEvent) {
        match event {
            NetworkEvent::BlocksAdded { blocks, .. } => {
                for block in blocks {
                    self.window.push(block.clone());
                }
                if let Some(last) = blocks.last() {
                    self.last_block_height = Some(last.number);
                }
            }
            NetworkEvent::Initialized { height, .. } | NetworkEvent::Reorganized { height, .. } => {
                match height {
                    Some(h) => self.window.rewind_to(*h),
                    None => self.window.clear(),
                }
                self.last_block_height = *height;
            }
            NetworkEvent::Cleared { .. } => {
                self.window.clear();
                self.last_block_height = None;
            }
        }
    }

    fn record(&mut self, event: NetworkEvent) {
        self.apply(&event);
        self.version += 1;
        self.pending.push(event);
    }

    /// Mark the point after which ingestion resumes.
    pub fn init(&mut self, request_id: &str, height: Option<u64>) {
        self.record(NetworkEvent::Initialized {
            request_id: request_id.to_string(),
            height,
        });
    }

    /// Extend the chain with `blocks`, or signal a fork if they don't chain from the head.
    pub fn add_blocks(&mut self, request_id: &str, blocks: &[Block]) -> Result<(), SyncError> {
        let first = blocks
            .first()
            .ok_or_else(|| SyncError::Other("cannot add an empty batch".into()))?;

        match self.window.head() {
            Some(head) if !first.extends(head) => {
                return Err(SyncError::ForkDetected {
                    height: first.number,
                    expected: head.hash.clone(),
                    actual: first.parent_hash.clone(),
                });
            }
            Some(_) => {}
            None => {
                let expected = self.last_block_height.map_or(0, |h| h + 1);
                if first.number != expected {
                    return Err(SyncError::ForkDetected {
                        height: first.number,
                        expected: format!("block #{expected}"),
                        actual: format!("block #{}", first.number),
                    });
                }
            }
        }

        for pair in blocks.windows(2) {
            if !pair[1].extends(&pair[0]) {
                return Err(SyncError::ForkDetected {
                    height: pair[1].number,
                    expected: pair[0].hash.clone(),
                    actual: pair[1].parent_hash.clone(),
                });
            }
        }

        self.record(NetworkEvent::BlocksAdded {
            request_id: request_id.to_string(),
            blocks: blocks.to_vec(),
        });
        Ok(())
    }

    /// Walk back from the head until the retained block matches the canonical
    /// chain, and record the rollback. Returns the new last height.
    ///
    /// Blocks above `seed_height` are dropped without asking the source. If the
    /// window runs out before a match, the target is one below the lowest
    /// dropped block.
    pub async fn reorganise(
        &mut self,
        request_id: &str,
        seed_height: Option<u64>,
        source: &dyn BlockSource,
    ) -> Result<Option<u64>, SyncError> {
        let mut target = std::cmp::min(seed_height, self.last_block_height);
        let mut dropped = Vec::new();

        for local in self.window.iter().rev() {
            let above_target = match target {
                Some(t) => local.number > t,
                None => true,
            };
            if !above_target {
                let canonical = source.block_by_height(local.number).await?;
                if matches!(&canonical, Some(c) if c.hash == local.hash) {
                    break;
                }
                target = local.number.checked_sub(1);
            }
            dropped.push(local.clone());
        }

        tracing::warn!(
            network = %self.id,
            seed = %fmt_height(seed_height),
            from = %fmt_height(self.last_block_height),
            to = %fmt_height(target),
            depth = dropped.len(),
            "Network reorganised"
        );

        self.record(NetworkEvent::Reorganized {
            request_id: request_id.to_string(),
            height: target,
            blocks: dropped,
        });
        Ok(target)
    }

    /// Reset to empty and return the `Cleared` notification.
    ///
    /// The notification is not recorded as pending; it is never persisted.
    pub fn clear(&mut self, request_id: &str) -> NetworkEvent {
        let event = NetworkEvent::Cleared {
            request_id: request_id.to_string(),
        };
        self.apply(&event);
        self.version = 0;
        self.pending.clear();
        event
    }

    /// Drain pending events into a store commit, or `None` if nothing changed.
    pub fn take_commit(&mut self) -> Result<Option<NetworkCommit>, SyncError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let events = std::mem::take(&mut self.pending);
        let new_events = events
            .iter()
            .map(|e| {
                Ok(NewEvent {
                    event_type: e.kind().to_string(),
                    block_height: e.block_height(),
                    request_id: e.request_id().to_string(),
                    payload: serde_json::to_value(e)?,
                })
            })
            .collect::<Result<Vec<_>, SyncError>>()?;

        Ok(Some(NetworkCommit {
            commit: AggregateCommit {
                aggregate_id: self.id.clone(),
                expected_version: self.version - events.len() as u64,
                events: new_events,
            },
            events,
        }))
    }
}
