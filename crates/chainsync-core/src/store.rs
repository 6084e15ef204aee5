//! Event store contract — the durable log behind every aggregate.
//!
//! The network and each read model are event-sourced aggregates. The store
//! keeps, per aggregate id, a contiguous 1-based sequence of events, each
//! tagged with the block height it belongs to. Two write operations exist:
//!
//! - [`EventStore::append`] — atomic multi-aggregate append with optimistic
//!   version checks.
//! - [`EventStore::rollback`] — truncate a set of aggregates above a height and
//!   append the given commits, all in one atomic step.
//!
//! Snapshots are a read cache: the serialized state of an aggregate at some
//! version. Rehydration starts from the latest usable snapshot and replays
//! only the events after it. Truncation drops snapshots above the height too.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::SyncError;

/// An event as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub aggregate_id: String,
    /// 1-based position within the aggregate.
    pub version: u64,
    /// Block the event belongs to; `None` for events on an empty chain.
    pub block_height: Option<u64>,
    pub event_type: String,
    pub request_id: String,
    pub payload: serde_json::Value,
    /// Unix timestamp (seconds) when the event was appended.
    pub timestamp: i64,
}

/// An event not yet assigned a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: String,
    pub block_height: Option<u64>,
    pub request_id: String,
    pub payload: serde_json::Value,
}

/// Pending events for one aggregate, guarded by the version they were built on.
#[derive(Debug, Clone)]
pub struct AggregateCommit {
    pub aggregate_id: String,
    pub expected_version: u64,
    pub events: Vec<NewEvent>,
}

/// Latest persisted position of an aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateInfo {
    pub aggregate_id: String,
    pub version: u64,
    /// Block height of the latest event.
    pub block_height: Option<u64>,
}

/// Serialized aggregate state as of `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_id: String,
    pub version: u64,
    /// Height of the aggregate when the snapshot was taken.
    pub block_height: Option<u64>,
    pub state: serde_json::Value,
}

/// Returns `true` if a snapshot taken at `snapshot_height` is usable at `max_height`.
pub fn snapshot_visible(snapshot_height: Option<u64>, max_height: Option<u64>) -> bool {
    match (max_height, snapshot_height) {
        (Some(max), Some(h)) => h <= max,
        _ => true,
    }
}

/// Paginated event read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventQuery {
    /// Aggregates to read (empty = all).
    pub aggregate_ids: Vec<String>,
    /// Only events at or below this block height.
    pub max_height: Option<u64>,
    /// Only events at or above this version.
    pub min_version: Option<u64>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl EventQuery {
    pub fn aggregate(id: impl Into<String>) -> Self {
        Self {
            aggregate_ids: vec![id.into()],
            ..Default::default()
        }
    }

    pub fn max_height(mut self, height: u64) -> Self {
        self.max_height = Some(height);
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    /// Returns `true` if `event` passes the id/height/version filters.
    pub fn matches(&self, event: &StoredEvent) -> bool {
        let id_ok = self.aggregate_ids.is_empty() || self.aggregate_ids.contains(&event.aggregate_id);
        let height_ok = match (self.max_height, event.block_height) {
            (Some(max), Some(h)) => h <= max,
            _ => true,
        };
        let version_ok = self.min_version.map_or(true, |min| event.version >= min);
        id_ok && height_ok && version_ok
    }
}

/// Returns `true` if an event survives truncation to `height`.
///
/// `None` truncates everything; events without a height survive any `Some`.
pub fn retained_at(event_height: Option<u64>, height: Option<u64>) -> bool {
    match (height, event_height) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(max), Some(h)) => h <= max,
    }
}

/// Storage contract consumed by the core.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// All events of one aggregate in version order.
    async fn load_events(&self, aggregate_id: &str) -> Result<Vec<StoredEvent>, SyncError>;

    /// Append all commits atomically; nothing is written if any check fails.
    async fn append(&self, commits: Vec<AggregateCommit>) -> Result<(), SyncError>;

    /// Drop events above `height` for `truncate` ids, then append `commits`, atomically.
    async fn rollback(
        &self,
        truncate: &[String],
        height: Option<u64>,
        commits: Vec<AggregateCommit>,
    ) -> Result<(), SyncError>;

    /// Filtered, paginated read ordered by aggregate id then version.
    async fn fetch_events(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, SyncError>;

    /// Latest version and height of every aggregate with events.
    async fn aggregates(&self) -> Result<Vec<AggregateInfo>, SyncError>;

    /// Store a snapshot, replacing any earlier one at the same version.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), SyncError>;

    /// Highest-version snapshot of an aggregate taken at or below `max_height`
    /// (`None` = any height).
    async fn load_snapshot(
        &self,
        aggregate_id: &str,
        max_height: Option<u64>,
    ) -> Result<Option<Snapshot>, SyncError>;

    /// Latest position of one aggregate, if it has events.
    async fn aggregate(&self, aggregate_id: &str) -> Result<Option<AggregateInfo>, SyncError> {
        let events = self.load_events(aggregate_id).await?;
        Ok(events.last().map(|e| AggregateInfo {
            aggregate_id: e.aggregate_id.clone(),
            version: e.version,
            block_height: e.block_height,
        }))
    }
}

// ─── In-memory store ──────────────────────────────────────────────────────────

#[derive(Default, Clone)]
struct MemoryState {
    streams: BTreeMap<String, Vec<StoredEvent>>,
    snapshots: BTreeMap<String, BTreeMap<u64, Snapshot>>,
}

/// In-memory event store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryEventStore {
    state: Mutex<MemoryState>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, SyncError> {
        self.state
            .lock()
            .map_err(|_| SyncError::Storage("memory store lock poisoned".into()))
    }

    /// Total number of stored events.
    pub fn event_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.streams.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Total number of stored snapshots.
    pub fn snapshot_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.snapshots.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }
}

/// Checks every commit against `streams`, then applies them all.
fn apply_commits(
    streams: &mut BTreeMap<String, Vec<StoredEvent>>,
    commits: Vec<AggregateCommit>,
) -> Result<(), SyncError> {
    for commit in &commits {
        let current = streams
            .get(&commit.aggregate_id)
            .and_then(|s| s.last())
            .map_or(0, |e| e.version);
        if current != commit.expected_version {
            return Err(SyncError::Storage(format!(
                "version conflict on '{}': expected {}, found {}",
                commit.aggregate_id, commit.expected_version, current
            )));
        }
    }

    let now = chrono::Utc::now().timestamp();
    for commit in commits {
        let stream = streams.entry(commit.aggregate_id.clone()).or_default();
        for (i, event) in commit.events.into_iter().enumerate() {
            stream.push(StoredEvent {
                aggregate_id: commit.aggregate_id.clone(),
                version: commit.expected_version + i as u64 + 1,
                block_height: event.block_height,
                event_type: event.event_type,
                request_id: event.request_id,
                payload: event.payload,
                timestamp: now,
            });
        }
    }
    Ok(())
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn load_events(&self, aggregate_id: &str) -> Result<Vec<StoredEvent>, SyncError> {
        Ok(self.state()?.streams.get(aggregate_id).cloned().unwrap_or_default())
    }

    async fn append(&self, commits: Vec<AggregateCommit>) -> Result<(), SyncError> {
        let mut state = self.state()?;
        apply_commits(&mut state.streams, commits)
    }

    async fn rollback(
        &self,
        truncate: &[String],
        height: Option<u64>,
        commits: Vec<AggregateCommit>,
    ) -> Result<(), SyncError> {
        let mut state = self.state()?;
        // Work on a copy so a failed commit leaves the truncation unapplied too.
        let mut staged = state.clone();
        for id in truncate {
            if let Some(stream) = staged.streams.get_mut(id) {
                stream.retain(|e| retained_at(e.block_height, height));
            }
            if let Some(snapshots) = staged.snapshots.get_mut(id) {
                snapshots.retain(|_, snap| retained_at(snap.block_height, height));
            }
        }
        staged.streams.retain(|_, s| !s.is_empty());
        staged.snapshots.retain(|_, s| !s.is_empty());
        apply_commits(&mut staged.streams, commits)?;
        *state = staged;
        Ok(())
    }

    async fn fetch_events(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, SyncError> {
        let state = self.state()?;
        let matching = state
            .streams
            .values()
            .flatten()
            .filter(|e| query.matches(e))
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(matching)
    }

    async fn aggregates(&self) -> Result<Vec<AggregateInfo>, SyncError> {
        Ok(self
            .state()?
            .streams
            .iter()
            .filter_map(|(id, stream)| {
                stream.last().map(|e| AggregateInfo {
                    aggregate_id: id.clone(),
                    version: e.version,
                    block_height: e.block_height,
                })
            })
            .collect())
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), SyncError> {
        self.state()?
            .snapshots
            .entry(snapshot.aggregate_id.clone())
            .or_default()
            .insert(snapshot.version, snapshot);
        Ok(())
    }

    async fn load_snapshot(
        &self,
        aggregate_id: &str,
        max_height: Option<u64>,
    ) -> Result<Option<Snapshot>, SyncError> {
        Ok(self.state()?.snapshots.get(aggregate_id).and_then(|by_version| {
            by_version
                .values()
                .rev()
                .find(|snap| snapshot_visible(snap.block_height, max_height))
                .cloned()
        }))
    }
}
