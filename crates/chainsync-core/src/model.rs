//! Read-model trait, per-batch model instances, and the constructor registry.
//!
//! A read model is a user-defined, event-sourced projection. For every block
//! it *decides* which events to emit (`parse_block`, read-only) and *folds*
//! each emitted event into its state (`apply`). The same `apply` is used when
//! the model is rehydrated from the store, so live and replayed state agree.
//!
//! Models that implement [`ReadModel::snapshot`] and [`ReadModel::restore`]
//! are periodically snapshotted, so rehydration replays only recent events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::SyncError;
use crate::store::{AggregateCommit, NewEvent, Snapshot, StoredEvent};
use crate::types::Block;

/// An event emitted by a read model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEvent {
    /// Event name chosen by the model (e.g. `"transfer_seen"`).
    pub kind: String,
    /// Block the event was emitted for.
    pub block_height: u64,
    pub payload: serde_json::Value,
}

/// Collects the events a model emits for one block.
#[derive(Debug)]
pub struct BlockContext {
    model: String,
    request_id: String,
    block_height: u64,
    events: Vec<ModelEvent>,
}

impl BlockContext {
    fn new(model: &str, request_id: &str, block_height: u64) -> Self {
        Self {
            model: model.to_string(),
            request_id: request_id.to_string(),
            block_height,
            events: Vec::new(),
        }
    }

    /// Request id of the batch being ingested.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Queue an event for the current block.
    pub fn emit(&mut self, kind: impl Into<String>, payload: impl Serialize) -> Result<(), SyncError> {
        self.events.push(ModelEvent {
            kind: kind.into(),
            block_height: self.block_height,
            payload: serde_json::to_value(payload)
                .map_err(|e| SyncError::model(&self.model, format!("event payload: {e}")))?,
        });
        Ok(())
    }
}

/// Trait for user-provided read models.
#[async_trait]
pub trait ReadModel: Send + Sync {
    /// Stable aggregate id under which the model's events are stored.
    fn aggregate_id(&self) -> &str;

    /// Inspect `block` and emit zero or more events through `ctx`.
    async fn parse_block(&self, block: &Block, ctx: &mut BlockContext) -> Result<(), SyncError>;

    /// Fold one event into the model's state.
    fn apply(&mut self, event: &ModelEvent) -> Result<(), SyncError>;

    /// JSON view of the current state, served by the query side.
    fn state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Serialized state for snapshots. `None` opts the model out.
    fn snapshot(&self) -> Option<serde_json::Value> {
        None
    }

    /// Replace the state with one produced by [`ReadModel::snapshot`].
    fn restore(&mut self, _state: serde_json::Value) -> Result<(), SyncError> {
        Err(SyncError::model(self.aggregate_id(), "snapshots are not supported"))
    }
}

// ─── ModelInstance ────────────────────────────────────────────────────────────

/// A read model plus its event-sourcing bookkeeping, alive for one unit of work.
pub struct ModelInstance {
    model: Box<dyn ReadModel>,
    version: u64,
    last_block_height: Option<u64>,
    pending: Vec<NewEvent>,
}

impl ModelInstance {
    pub fn new(model: Box<dyn ReadModel>) -> Self {
        Self {
            model,
            version: 0,
            last_block_height: None,
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.model.aggregate_id()
    }

    /// Version including pending events.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn last_block_height(&self) -> Option<u64> {
        self.last_block_height
    }

    pub fn state(&self) -> serde_json::Value {
        self.model.state()
    }

    /// Rebuild state from persisted events (version order).
    pub fn replay(&mut self, events: &[StoredEvent]) -> Result<(), SyncError> {
        for stored in events {
            let block_height = stored.block_height.ok_or_else(|| {
                SyncError::model(self.id(), format!("event v{} has no block height", stored.version))
            })?;
            let event = ModelEvent {
                kind: stored.event_type.clone(),
                block_height,
                payload: stored.payload.clone(),
            };
            self.model.apply(&event)?;
            self.version = stored.version;
            self.last_block_height = Some(block_height);
        }
        Ok(())
    }

    /// Restore from a snapshot; events after it are replayed separately.
    pub fn restore_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), SyncError> {
        self.model.restore(snapshot.state.clone())?;
        self.version = snapshot.version;
        self.last_block_height = snapshot.block_height;
        Ok(())
    }

    /// Snapshot of the committed state, if the model supports snapshots.
    pub fn snapshot(&self) -> Option<Snapshot> {
        if self.is_dirty() {
            return None;
        }
        self.model.snapshot().map(|state| Snapshot {
            aggregate_id: self.id().to_string(),
            version: self.version,
            block_height: self.last_block_height,
            state,
        })
    }

    /// Let the model consume one block, applying whatever it emits.
    pub async fn parse_block(&mut self, block: &Block, request_id: &str) -> Result<(), SyncError> {
        let mut ctx = BlockContext::new(self.id(), request_id, block.number);
        self.model.parse_block(block, &mut ctx).await?;

        for event in ctx.events {
            self.model.apply(&event)?;
            self.version += 1;
            self.last_block_height = Some(event.block_height);
            self.pending.push(NewEvent {
                event_type: event.kind,
                block_height: Some(event.block_height),
                request_id: request_id.to_string(),
                payload: event.payload,
            });
        }
        Ok(())
    }

    /// Returns `true` if the instance has events not yet persisted.
    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drain pending events into a commit, or `None` if nothing changed.
    pub fn take_commit(&mut self) -> Option<AggregateCommit> {
        if self.pending.is_empty() {
            return None;
        }
        let events = std::mem::take(&mut self.pending);
        Some(AggregateCommit {
            aggregate_id: self.id().to_string(),
            expected_version: self.version - events.len() as u64,
            events,
        })
    }
}

impl std::fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelInstance")
            .field("id", &self.id())
            .field("version", &self.version)
            .field("last_block_height", &self.last_block_height)
            .field("pending", &self.pending.len())
            .finish()
    }
}

// ─── ModelRegistry ────────────────────────────────────────────────────────────

/// Builds a fresh, empty read model.
pub type ModelConstructor = Arc<dyn Fn() -> Box<dyn ReadModel> + Send + Sync>;

/// Registry of read-model constructors.
///
/// Instances are never cached: every unit of work asks for fresh ones.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    constructors: Vec<ModelConstructor>,
    ids: Vec<String>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model constructor. Aggregate ids must be unique.
    pub fn register<M, F>(&mut self, constructor: F) -> Result<(), SyncError>
    where
        M: ReadModel + 'static,
        F: Fn() -> M + Send + Sync + 'static,
    {
        let id = constructor().aggregate_id().to_string();
        if self.ids.contains(&id) {
            return Err(SyncError::Config(format!("read model '{id}' registered twice")));
        }
        self.ids.push(id);
        self.constructors
            .push(Arc::new(move || Box::new(constructor()) as Box<dyn ReadModel>));
        Ok(())
    }

    /// Builder-style [`ModelRegistry::register`].
    pub fn with<M, F>(mut self, constructor: F) -> Result<Self, SyncError>
    where
        M: ReadModel + 'static,
        F: Fn() -> M + Send + Sync + 'static,
    {
        self.register(constructor)?;
        Ok(self)
    }

    /// Fresh, empty instances of every registered model.
    pub fn instantiate(&self) -> Vec<ModelInstance> {
        self.constructors
            .iter()
            .map(|ctor| ModelInstance::new(ctor()))
            .collect()
    }

    /// A fresh instance of the model with `aggregate_id`, if registered.
    pub fn instantiate_one(&self, aggregate_id: &str) -> Option<ModelInstance> {
        self.ids
            .iter()
            .position(|id| id == aggregate_id)
            .map(|i| ModelInstance::new((self.constructors[i])()))
    }

    /// Aggregate ids in registration order.
    pub fn aggregate_ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}
