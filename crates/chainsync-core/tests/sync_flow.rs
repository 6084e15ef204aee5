//! End-to-end ingestion, fork recovery and atomicity through `SyncEngine`.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chainsync_core::{
    BatchOutcome, BlockBatch, EventQuery, EventStore, MemoryEventStore, SyncConfig, SyncError,
};
use common::*;

fn single(n: u64) -> BlockBatch {
    BlockBatch::new(format!("req-{n}"), vec![block(n)])
}

async fn network_height(h: &Harness) -> Option<u64> {
    let snapshots = h
        .engine
        .query()
        .get_models(&["network".to_string()], None)
        .await
        .unwrap();
    snapshots[0].block_height
}

#[tokio::test]
async fn single_block_batches_then_fork_back_to_zero() {
    let chain = MockChain::new((0..3).map(block));
    let h = harness(Arc::new(MemoryEventStore::new()), chain, counters(1), Some(0));
    let _router = h.engine.start().await.unwrap();
    wait_for_call(&h.pipeline, "start:None").await;

    for n in 0..2 {
        let outcome = h.engine.handle_batch(&single(n)).await.unwrap();
        assert_eq!(outcome, BatchOutcome::Committed { height: n, blocks: 1 });
        assert_eq!(height_of(h.store.as_ref(), "counter-0").await, Some(n));
        assert_eq!(version_of(h.store.as_ref(), "counter-0").await, n + 1);
    }
    wait_for_call(&h.pipeline, "confirm:0xa1").await;

    // Blocks 1 and 2 are replaced on the canonical chain.
    h.chain.replace([block_on(1, "b", "a"), block_on(2, "b", "b")]);
    let forked = BlockBatch::new("req-2", vec![block_on(2, "b", "b")]);
    let outcome = h.engine.handle_batch(&forked).await.unwrap();
    assert_eq!(outcome, BatchOutcome::Reorganized { height: Some(0) });

    assert_eq!(height_of(h.store.as_ref(), "counter-0").await, Some(0));
    assert_eq!(version_of(h.store.as_ref(), "counter-0").await, 1);
    assert_eq!(network_height(&h).await, Some(0));
    let reorgs = event_types(h.store.as_ref(), "network")
        .await
        .into_iter()
        .filter(|t| t == "reorganized")
        .count();
    assert_eq!(reorgs, 1);
    wait_for_call(&h.pipeline, "reorganize:Some(0)").await;

    // The pipeline redelivers the new branch.
    let redelivered = BlockBatch::new("req-3", vec![block_on(1, "b", "a"), block_on(2, "b", "b")]);
    let outcome = h.engine.handle_batch(&redelivered).await.unwrap();
    assert_eq!(outcome, BatchOutcome::Committed { height: 2, blocks: 2 });
    assert_eq!(version_of(h.store.as_ref(), "counter-0").await, 3);

    let snapshot = h
        .engine
        .query()
        .get_models(&["counter-0".to_string()], None)
        .await
        .unwrap();
    assert_eq!(snapshot[0].state["count"], 3);
    assert_eq!(snapshot[0].state["last_hash"], "0xb2");
}

#[tokio::test]
async fn height_advances_by_batch_length_for_any_model_count() {
    for k in 0..=3 {
        let chain = MockChain::new((0..8).map(block));
        let h = harness(Arc::new(MemoryEventStore::new()), chain, counters(k), Some(0));
        h.engine.start().await.unwrap();

        let first = BlockBatch::new("a", (0..3).map(block).collect());
        assert_eq!(
            h.engine.handle_batch(&first).await.unwrap(),
            BatchOutcome::Committed { height: 2, blocks: 3 }
        );
        let second = BlockBatch::new("b", (3..8).map(block).collect());
        assert_eq!(
            h.engine.handle_batch(&second).await.unwrap(),
            BatchOutcome::Committed { height: 7, blocks: 5 }
        );

        assert_eq!(network_height(&h).await, Some(7), "k={k}");
        for i in 0..k {
            let id = format!("counter-{i}");
            assert_eq!(height_of(h.store.as_ref(), &id).await, Some(7));
            assert_eq!(version_of(h.store.as_ref(), &id).await, 8);
        }
    }
}

#[tokio::test]
async fn recovery_is_idempotent() {
    let chain = MockChain::new((0..4).map(block));
    let h = harness(Arc::new(MemoryEventStore::new()), chain, counters(2), Some(0));
    h.engine.start().await.unwrap();
    let batch = BlockBatch::new("all", (0..4).map(block).collect());
    h.engine.handle_batch(&batch).await.unwrap();

    h.chain.replace([block_on(2, "b", "a"), block_on(3, "b", "b")]);
    let once = h.engine.recover("first").await.unwrap();
    let twice = h.engine.recover("second").await.unwrap();
    assert_eq!(once, Some(1));
    assert_eq!(twice, once);

    for id in ["counter-0", "counter-1"] {
        assert_eq!(height_of(h.store.as_ref(), id).await, Some(1));
        assert_eq!(version_of(h.store.as_ref(), id).await, 2);
    }
    assert_eq!(network_height(&h).await, Some(1));
}

#[tokio::test]
async fn model_heights_never_pass_the_network() {
    let chain = MockChain::new((0..6).map(block));
    let h = harness(Arc::new(MemoryEventStore::new()), chain, counters(2), Some(0));
    h.engine.start().await.unwrap();
    h.engine
        .handle_batch(&BlockBatch::new("a", (0..6).map(block).collect()))
        .await
        .unwrap();

    // Deep fork: everything above block 0 changes.
    h.chain
        .replace((1..6).map(|n| block_on(n, "c", if n == 1 { "a" } else { "c" })));
    let forked = BlockBatch::new("b", vec![block_on(6, "c", "c")]);
    h.engine.handle_batch(&forked).await.unwrap();

    let network = network_height(&h).await;
    assert_eq!(network, Some(0));
    for info in h.store.aggregates().await.unwrap() {
        if info.aggregate_id != "network" {
            assert!(info.block_height <= network, "{info:?}");
        }
    }
}

#[tokio::test]
async fn failed_commit_leaves_store_untouched() {
    let chain = MockChain::new((0..3).map(block));
    let store = Arc::new(FlakyStore::default());
    let dyn_store: Arc<dyn EventStore> = store.clone();
    let h = harness(dyn_store, chain, counters(2), Some(0));
    h.engine.start().await.unwrap();
    h.engine.handle_batch(&single(0)).await.unwrap();
    h.engine.handle_batch(&single(1)).await.unwrap();

    let before = store.inner.fetch_events(&EventQuery::default()).await.unwrap();
    store.fail_writes.store(true, Ordering::SeqCst);

    let err = h.engine.handle_batch(&single(2)).await.unwrap_err();
    assert!(matches!(err, SyncError::Storage(_)));
    let after = store.inner.fetch_events(&EventQuery::default()).await.unwrap();
    assert_eq!(before, after);

    // A fork whose rollback cannot be written changes nothing either.
    h.chain.replace([block_on(1, "b", "a"), block_on(2, "b", "b")]);
    let forked = BlockBatch::new("fork", vec![block_on(2, "b", "b")]);
    assert!(h.engine.handle_batch(&forked).await.is_err());
    let after = store.inner.fetch_events(&EventQuery::default()).await.unwrap();
    assert_eq!(before, after);

    // Redelivery succeeds once the store recovers.
    store.fail_writes.store(false, Ordering::SeqCst);
    let outcome = h.engine.handle_batch(&forked).await.unwrap();
    assert_eq!(outcome, BatchOutcome::Reorganized { height: Some(0) });
}

#[tokio::test]
async fn model_error_mid_batch_commits_nothing() {
    let chain = MockChain::new((0..4).map(block));
    let registry = counters(1).with(|| FailingModel { at: 2 }).unwrap();
    let h = harness(Arc::new(MemoryEventStore::new()), chain, registry, Some(0));
    h.engine.start().await.unwrap();
    h.engine.handle_batch(&single(0)).await.unwrap();
    let before = h.store.fetch_events(&EventQuery::default()).await.unwrap();

    let batch = BlockBatch::new("mid", (1..4).map(block).collect());
    match h.engine.handle_batch(&batch).await.unwrap_err() {
        SyncError::Model { model, reason } => {
            assert_eq!(model, "failing");
            assert_eq!(reason, "cannot parse block");
        }
        other => panic!("unexpected {other:?}"),
    }

    let after = h.store.fetch_events(&EventQuery::default()).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(version_of(h.store.as_ref(), "counter-0").await, 1);
    assert_eq!(network_height(&h).await, Some(0));
}

#[tokio::test]
async fn snapshots_bound_replay_per_batch() {
    let chain = MockChain::new((0..200).map(block));
    let store = Arc::new(CountingStore::default());
    let config = SyncConfig::builder()
        .window_size(16)
        .start_height(0)
        .snapshot_interval(10)
        .build();
    let h = harness_with_config(store.clone(), chain, counters(1), config, false);
    h.engine.start().await.unwrap();

    let mut worst = 0;
    for n in 0..200 {
        store.take_reads();
        h.engine.handle_batch(&single(n)).await.unwrap();
        worst = worst.max(store.take_reads());
    }
    // At most interval - 1 events per aggregate after its latest snapshot.
    assert!(worst <= 18, "replayed {worst} events for one batch");

    let latest = h
        .engine
        .query()
        .get_models(&["counter-0".to_string()], None)
        .await
        .unwrap();
    assert_eq!(latest[0].version, 200);
    assert_eq!(latest[0].state["count"], 200);
    assert_eq!(latest[0].state["last_hash"], "0xa199");
    assert_eq!(network_height(&h).await, Some(199));

    let past = h
        .engine
        .query()
        .get_models(&["counter-0".to_string()], Some(55))
        .await
        .unwrap();
    assert_eq!(past[0].version, 56);
    assert_eq!(past[0].state["count"], 56);
}

#[tokio::test]
async fn fork_below_a_snapshot_discards_it() {
    let chain = MockChain::new((0..6).map(block));
    let store = Arc::new(MemoryEventStore::new());
    let config = SyncConfig::builder()
        .window_size(16)
        .start_height(0)
        .snapshot_interval(2)
        .build();
    let h = harness_with_config(store.clone(), chain, counters(1), config, false);
    h.engine.start().await.unwrap();
    for n in 0..6 {
        h.engine.handle_batch(&single(n)).await.unwrap();
    }
    let snapshot = store.load_snapshot("counter-0", None).await.unwrap().unwrap();
    assert_eq!(snapshot.version, 6);

    h.chain.replace([
        block_on(3, "b", "a"),
        block_on(4, "b", "b"),
        block_on(5, "b", "b"),
        block_on(6, "b", "b"),
    ]);
    let forked = BlockBatch::new("fork", vec![block_on(6, "b", "b")]);
    assert_eq!(
        h.engine.handle_batch(&forked).await.unwrap(),
        BatchOutcome::Reorganized { height: Some(2) }
    );
    let kept = store.load_snapshot("counter-0", None).await.unwrap().unwrap();
    assert_eq!(kept.version, 2);
    assert_eq!(kept.block_height, Some(1));

    let rolled_back = h
        .engine
        .query()
        .get_models(&["counter-0".to_string()], None)
        .await
        .unwrap();
    assert_eq!(rolled_back[0].version, 3);
    assert_eq!(rolled_back[0].state["last_hash"], "0xa2");

    let branch = vec![
        block_on(3, "b", "a"),
        block_on(4, "b", "b"),
        block_on(5, "b", "b"),
        block_on(6, "b", "b"),
    ];
    assert_eq!(
        h.engine.handle_batch(&BlockBatch::new("branch", branch)).await.unwrap(),
        BatchOutcome::Committed { height: 6, blocks: 4 }
    );
    let after = h
        .engine
        .query()
        .get_models(&["counter-0".to_string()], None)
        .await
        .unwrap();
    assert_eq!(after[0].state["count"], 7);
    assert_eq!(after[0].state["last_hash"], "0xb6");
}

#[tokio::test]
async fn batches_above_max_height_are_rejected() {
    let chain = MockChain::new((0..3).map(block));
    let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
    let pipeline = Arc::new(RecordingPipeline::default());
    let config = SyncConfig::builder()
        .start_height(0)
        .max_block_height(1)
        .build();
    let engine = chainsync_core::SyncEngine::new(
        config,
        chainsync_core::EngineParts {
            store: store.clone(),
            source: chain,
            pipeline,
            prompt: Arc::new(chainsync_core::FixedPrompt(false)),
            registry: counters(1),
        },
    )
    .unwrap();
    engine.start().await.unwrap();

    let batch = BlockBatch::new("x", (0..3).map(block).collect());
    let err = engine.handle_batch(&batch).await.unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
    assert_eq!(version_of(store.as_ref(), "counter-0").await, 0);

    let empty = BlockBatch::new("y", vec![]);
    assert_eq!(engine.handle_batch(&empty).await.unwrap(), BatchOutcome::Skipped);
}

#[tokio::test]
async fn query_rejects_unknown_models_and_reads_history() {
    let chain = MockChain::new((0..4).map(block));
    let h = harness(Arc::new(MemoryEventStore::new()), chain, counters(1), Some(0));
    h.engine.start().await.unwrap();
    for n in 0..4 {
        h.engine.handle_batch(&single(n)).await.unwrap();
    }

    let err = h
        .engine
        .query()
        .get_models(&["nope".to_string()], None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("nope"));

    let past = h
        .engine
        .query()
        .get_models(&["counter-0".to_string(), "network".to_string()], Some(1))
        .await
        .unwrap();
    assert_eq!(past[0].block_height, Some(1));
    assert_eq!(past[0].state["count"], 2);
    assert_eq!(past[1].block_height, Some(1));

    let page = h
        .engine
        .query()
        .fetch_events(&EventQuery::aggregate("counter-0").page(2, 1))
        .await
        .unwrap();
    assert_eq!(page.iter().map(|e| e.version).collect::<Vec<_>>(), vec![2, 3]);
}
