//! Ingest-path metrics.
//!
//! Durations are recorded into OpenTelemetry histograms and counters, which
//! can be exported via OTLP once the embedder installs a meter provider. The
//! running totals kept alongside feed the per-batch stats log line.

use opentelemetry::{
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Time spent rehydrating read models.
pub const RESTORE_MODELS: &str = "restore_models";
/// Time spent letting read models consume blocks.
pub const PARSE_BLOCK: &str = "parse_block";
/// Time spent in the atomic store commit.
pub const EVENTSTORE_SAVE: &str = "eventstore_save";

/// Metrics handle shared by the ingest path.
#[derive(Clone)]
pub struct SyncMetrics {
    pub restore_models_ms: Histogram<f64>,
    pub parse_block_ms: Histogram<f64>,
    pub eventstore_save_ms: Histogram<f64>,
    pub blocks_ingested: Counter<u64>,
    pub reorgs: Counter<u64>,
    attributes: Vec<KeyValue>,
    totals: Arc<Mutex<BTreeMap<&'static str, Duration>>>,
}

impl SyncMetrics {
    pub fn new(meter: &Meter, network_id: &str) -> Self {
        Self {
            restore_models_ms: meter
                .f64_histogram("chainsync.restore_models_ms")
                .with_description("Time to rehydrate read models for a batch in milliseconds")
                .build(),
            parse_block_ms: meter
                .f64_histogram("chainsync.parse_block_ms")
                .with_description("Time for every read model to consume one block in milliseconds")
                .build(),
            eventstore_save_ms: meter
                .f64_histogram("chainsync.eventstore_save_ms")
                .with_description("Time to commit a batch to the event store in milliseconds")
                .build(),
            blocks_ingested: meter
                .u64_counter("chainsync.blocks_ingested")
                .with_description("Blocks committed to the event store")
                .build(),
            reorgs: meter
                .u64_counter("chainsync.reorgs")
                .with_description("Fork recoveries performed")
                .build(),
            attributes: vec![KeyValue::new("network", network_id.to_string())],
            totals: Arc::default(),
        }
    }

    /// Instruments from the global meter provider (no-op until one is installed).
    pub fn global(network_id: &str) -> Self {
        Self::new(&opentelemetry::global::meter("chainsync"), network_id)
    }

    /// Await `fut`, recording its wall time under `key` whether it succeeds or not.
    pub async fn track<F, T>(&self, key: &'static str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let start = Instant::now();
        let out = fut.await;
        self.record(key, start.elapsed());
        out
    }

    pub fn record(&self, key: &'static str, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let histogram = match key {
            RESTORE_MODELS => Some(&self.restore_models_ms),
            PARSE_BLOCK => Some(&self.parse_block_ms),
            EVENTSTORE_SAVE => Some(&self.eventstore_save_ms),
            _ => None,
        };
        if let Some(histogram) = histogram {
            histogram.record(ms, &self.attributes);
        }
        if let Ok(mut totals) = self.totals.lock() {
            *totals.entry(key).or_default() += elapsed;
        }
    }

    pub fn record_blocks(&self, blocks: usize) {
        self.blocks_ingested.add(blocks as u64, &self.attributes);
    }

    pub fn record_reorg(&self) {
        self.reorgs.add(1, &self.attributes);
    }

    /// Accumulated time for `key` in milliseconds.
    pub fn total_ms(&self, key: &str) -> f64 {
        self.totals
            .lock()
            .ok()
            .and_then(|t| t.get(key).copied())
            .map_or(0.0, |d| d.as_secs_f64() * 1000.0)
    }

    /// Snapshot of all totals in milliseconds.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.totals
            .lock()
            .map(|t| {
                t.iter()
                    .map(|(k, d)| (k.to_string(), d.as_secs_f64() * 1000.0))
                    .collect()
            })
            .unwrap_or_default()
    }
}
