//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chainsync_core::{
    AggregateCommit, AggregateInfo, Block, BlockContext, BlockSource, EngineParts, EventQuery,
    EventStore, FetchPipeline, FixedPrompt, MemoryEventStore, ModelEvent, ModelRegistry,
    ReadModel, Snapshot, StoredEvent, SyncConfig, SyncEngine, SyncError,
};

// ─── Chain ────────────────────────────────────────────────────────────────────

/// Block `n` on branch `tag`, whose parent is block `n - 1` on `parent_tag`.
pub fn block_on(n: u64, tag: &str, parent_tag: &str) -> Block {
    let parent = if n == 0 {
        "0xgenesis".to_string()
    } else {
        format!("0x{parent_tag}{}", n - 1)
    };
    Block::new(n, format!("0x{tag}{n}"), parent)
}

pub fn block(n: u64) -> Block {
    block_on(n, "a", "a")
}

/// Canonical chain served to the core; tests rewrite it to simulate forks.
#[derive(Default)]
pub struct MockChain {
    blocks: Mutex<BTreeMap<u64, Block>>,
    tip: Mutex<Option<u64>>,
}

impl MockChain {
    pub fn new(blocks: impl IntoIterator<Item = Block>) -> Arc<Self> {
        let chain = Self::default();
        chain.replace(blocks);
        Arc::new(chain)
    }

    pub fn replace(&self, blocks: impl IntoIterator<Item = Block>) {
        let mut map = self.blocks.lock().unwrap();
        for b in blocks {
            map.insert(b.number, b);
        }
    }

    pub fn set_tip(&self, tip: u64) {
        *self.tip.lock().unwrap() = Some(tip);
    }
}

#[async_trait]
impl BlockSource for MockChain {
    async fn tip_height(&self) -> Result<u64, SyncError> {
        if let Some(tip) = *self.tip.lock().unwrap() {
            return Ok(tip);
        }
        Ok(self.blocks.lock().unwrap().keys().next_back().copied().unwrap_or(0))
    }

    async fn block_by_height(&self, height: u64) -> Result<Option<Block>, SyncError> {
        Ok(self.blocks.lock().unwrap().get(&height).cloned())
    }
}

// ─── Pipeline ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingPipeline {
    pub calls: Mutex<Vec<String>>,
}

impl RecordingPipeline {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FetchPipeline for RecordingPipeline {
    async fn start(&self, height: Option<u64>) -> Result<(), SyncError> {
        self.calls.lock().unwrap().push(format!("start:{height:?}"));
        Ok(())
    }

    async fn confirm(&self, hashes: &[String]) -> Result<(), SyncError> {
        self.calls.lock().unwrap().push(format!("confirm:{}", hashes.join(",")));
        Ok(())
    }

    async fn reorganize(&self, height: Option<u64>) -> Result<(), SyncError> {
        self.calls.lock().unwrap().push(format!("reorganize:{height:?}"));
        Ok(())
    }
}

// ─── Read model ───────────────────────────────────────────────────────────────

/// Counts blocks; emits one `block_seen` event per block.
pub struct BlockCounter {
    id: String,
    count: u64,
    last_hash: Option<String>,
}

impl BlockCounter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            count: 0,
            last_hash: None,
        }
    }
}

#[async_trait]
impl ReadModel for BlockCounter {
    fn aggregate_id(&self) -> &str {
        &self.id
    }

    async fn parse_block(&self, block: &Block, ctx: &mut BlockContext) -> Result<(), SyncError> {
        ctx.emit("block_seen", serde_json::json!({ "hash": block.hash }))
    }

    fn apply(&mut self, event: &ModelEvent) -> Result<(), SyncError> {
        self.count += 1;
        self.last_hash = event.payload["hash"].as_str().map(str::to_string);
        Ok(())
    }

    fn state(&self) -> serde_json::Value {
        serde_json::json!({ "count": self.count, "last_hash": self.last_hash })
    }

    fn snapshot(&self) -> Option<serde_json::Value> {
        Some(self.state())
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<(), SyncError> {
        self.count = state["count"]
            .as_u64()
            .ok_or_else(|| SyncError::model(&self.id, "snapshot has no count"))?;
        self.last_hash = state["last_hash"].as_str().map(str::to_string);
        Ok(())
    }
}

/// Fails on block `at`; emits one event for every other block.
pub struct FailingModel {
    pub at: u64,
}

#[async_trait]
impl ReadModel for FailingModel {
    fn aggregate_id(&self) -> &str {
        "failing"
    }

    async fn parse_block(&self, block: &Block, ctx: &mut BlockContext) -> Result<(), SyncError> {
        if block.number == self.at {
            return Err(SyncError::model("failing", "cannot parse block"));
        }
        ctx.emit("block_seen", block.number)
    }

    fn apply(&mut self, _event: &ModelEvent) -> Result<(), SyncError> {
        Ok(())
    }
}

pub fn counters(k: usize) -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    for i in 0..k {
        let id = format!("counter-{i}");
        registry
            .register(move || BlockCounter::new(id.clone()))
            .unwrap();
    }
    registry
}

// ─── Store wrapper ────────────────────────────────────────────────────────────

/// Memory store whose writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryEventStore,
    pub fail_writes: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> Result<(), SyncError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("disk on fire".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for FlakyStore {
    async fn load_events(&self, aggregate_id: &str) -> Result<Vec<StoredEvent>, SyncError> {
        self.inner.load_events(aggregate_id).await
    }

    async fn append(&self, commits: Vec<AggregateCommit>) -> Result<(), SyncError> {
        self.check()?;
        self.inner.append(commits).await
    }

    async fn rollback(
        &self,
        truncate: &[String],
        height: Option<u64>,
        commits: Vec<AggregateCommit>,
    ) -> Result<(), SyncError> {
        self.check()?;
        self.inner.rollback(truncate, height, commits).await
    }

    async fn fetch_events(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, SyncError> {
        self.inner.fetch_events(query).await
    }

    async fn aggregates(&self) -> Result<Vec<AggregateInfo>, SyncError> {
        self.inner.aggregates().await
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), SyncError> {
        self.check()?;
        self.inner.save_snapshot(snapshot).await
    }

    async fn load_snapshot(
        &self,
        aggregate_id: &str,
        max_height: Option<u64>,
    ) -> Result<Option<Snapshot>, SyncError> {
        self.inner.load_snapshot(aggregate_id, max_height).await
    }
}

/// Memory store that counts the events it hands out.
#[derive(Default)]
pub struct CountingStore {
    pub inner: MemoryEventStore,
    pub events_read: AtomicUsize,
}

impl CountingStore {
    /// Events read since the last call.
    pub fn take_reads(&self) -> usize {
        self.events_read.swap(0, Ordering::SeqCst)
    }

    fn count(&self, events: Vec<StoredEvent>) -> Vec<StoredEvent> {
        self.events_read.fetch_add(events.len(), Ordering::SeqCst);
        events
    }
}

#[async_trait]
impl EventStore for CountingStore {
    async fn load_events(&self, aggregate_id: &str) -> Result<Vec<StoredEvent>, SyncError> {
        self.inner.load_events(aggregate_id).await.map(|e| self.count(e))
    }

    async fn append(&self, commits: Vec<AggregateCommit>) -> Result<(), SyncError> {
        self.inner.append(commits).await
    }

    async fn rollback(
        &self,
        truncate: &[String],
        height: Option<u64>,
        commits: Vec<AggregateCommit>,
    ) -> Result<(), SyncError> {
        self.inner.rollback(truncate, height, commits).await
    }

    async fn fetch_events(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, SyncError> {
        self.inner.fetch_events(query).await.map(|e| self.count(e))
    }

    async fn aggregates(&self) -> Result<Vec<AggregateInfo>, SyncError> {
        self.inner.aggregates().await
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), SyncError> {
        self.inner.save_snapshot(snapshot).await
    }

    async fn load_snapshot(
        &self,
        aggregate_id: &str,
        max_height: Option<u64>,
    ) -> Result<Option<Snapshot>, SyncError> {
        self.inner.load_snapshot(aggregate_id, max_height).await
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct Harness {
    pub engine: SyncEngine,
    pub store: Arc<dyn EventStore>,
    pub chain: Arc<MockChain>,
    pub pipeline: Arc<RecordingPipeline>,
}

pub fn harness(
    store: Arc<dyn EventStore>,
    chain: Arc<MockChain>,
    registry: ModelRegistry,
    start_height: Option<u64>,
) -> Harness {
    harness_with_prompt(store, chain, registry, start_height, false)
}

pub fn harness_with_prompt(
    store: Arc<dyn EventStore>,
    chain: Arc<MockChain>,
    registry: ModelRegistry,
    start_height: Option<u64>,
    confirm_reset: bool,
) -> Harness {
    let mut builder = SyncConfig::builder().window_size(16);
    if let Some(h) = start_height {
        builder = builder.start_height(h);
    }
    harness_with_config(store, chain, registry, builder.build(), confirm_reset)
}

pub fn harness_with_config(
    store: Arc<dyn EventStore>,
    chain: Arc<MockChain>,
    registry: ModelRegistry,
    config: SyncConfig,
    confirm_reset: bool,
) -> Harness {
    let pipeline = Arc::new(RecordingPipeline::default());
    let engine = SyncEngine::new(
        config,
        EngineParts {
            store: store.clone(),
            source: chain.clone(),
            pipeline: pipeline.clone(),
            prompt: Arc::new(FixedPrompt(confirm_reset)),
            registry,
        },
    )
    .unwrap();
    Harness {
        engine,
        store,
        chain,
        pipeline,
    }
}

pub async fn height_of(store: &dyn EventStore, id: &str) -> Option<u64> {
    store.aggregate(id).await.unwrap().and_then(|a| a.block_height)
}

pub async fn version_of(store: &dyn EventStore, id: &str) -> u64 {
    store.aggregate(id).await.unwrap().map_or(0, |a| a.version)
}

pub async fn event_types(store: &dyn EventStore, id: &str) -> Vec<String> {
    store
        .load_events(id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

/// Wait until the pipeline has received `call`.
pub async fn wait_for_call(pipeline: &RecordingPipeline, call: &str) {
    let seen = tokio::time::timeout(Duration::from_secs(2), async {
        while !pipeline.calls().iter().any(|c| c == call) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(seen.is_ok(), "pipeline never saw {call}; got {:?}", pipeline.calls());
}
