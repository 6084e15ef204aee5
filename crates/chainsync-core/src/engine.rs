//! `SyncEngine`: wires the orchestrator, recovery, reconciler and saga
//! router around one event store and one event bus.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::event::NetworkEvent;
use crate::ingest::{BatchIngestor, BatchOutcome};
use crate::metrics::SyncMetrics;
use crate::model::ModelRegistry;
use crate::query::QueryService;
use crate::reconcile::{InitOutcome, Initializer, StartupReconciler};
use crate::recovery::ReorgRecovery;
use crate::rehydrate::Rehydrator;
use crate::retry::RetryPolicy;
use crate::saga::SagaRouter;
use crate::source::{BlockSource, ConfirmPrompt, FetchPipeline};
use crate::store::EventStore;
use crate::types::BlockBatch;

/// Everything the engine needs from the outside world.
pub struct EngineParts {
    pub store: Arc<dyn EventStore>,
    pub source: Arc<dyn BlockSource>,
    pub pipeline: Arc<dyn FetchPipeline>,
    pub prompt: Arc<dyn ConfirmPrompt>,
    pub registry: ModelRegistry,
}

pub struct SyncEngine {
    config: SyncConfig,
    bus: EventBus,
    ingestor: BatchIngestor,
    recovery: Arc<ReorgRecovery>,
    reconciler: Arc<StartupReconciler>,
    router: Arc<SagaRouter>,
    query: QueryService,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, parts: EngineParts) -> Result<Self, SyncError> {
        config.validate()?;
        let EngineParts {
            store,
            source,
            pipeline,
            prompt,
            registry,
        } = parts;

        let model_count = registry.len();
        let bus = EventBus::new(config.event_channel_capacity);
        let rehydrator = Rehydrator::new(
            store.clone(),
            Arc::new(registry),
            config.network_id.clone(),
            config.window_size,
        )
        .with_snapshot_interval(config.snapshot_interval);

        let recovery = Arc::new(ReorgRecovery::new(
            rehydrator.clone(),
            store.clone(),
            source.clone(),
            bus.clone(),
        ));
        let ingestor = BatchIngestor::new(
            rehydrator.clone(),
            store.clone(),
            recovery.clone(),
            bus.clone(),
            SyncMetrics::global(&config.network_id),
        )
        .with_max_block_height(config.max_block_height);
        let reconciler = Arc::new(
            StartupReconciler::new(rehydrator.clone(), store.clone(), source, prompt, bus.clone())
                .with_start_height(config.start_height),
        );
        let router = Arc::new(SagaRouter::new(
            pipeline,
            reconciler.clone(),
            RetryPolicy::new(config.retry.clone()),
        ));
        let query = QueryService::new(rehydrator, store);

        tracing::info!(
            network = %config.network_id,
            models = model_count,
            window = config.window_size,
            snapshot_interval = config.snapshot_interval,
            "Sync engine created"
        );

        Ok(Self {
            config,
            bus,
            ingestor,
            recovery,
            reconciler,
            router,
            query,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Spawn the saga router and run startup reconciliation once.
    ///
    /// The router subscribes before reconciliation so the `Initialized` (or
    /// `Cleared`) event it produces is not missed. If reconciliation fails the
    /// router is aborted and the error returned.
    pub async fn start(&self) -> Result<JoinHandle<Result<(), SyncError>>, SyncError> {
        let handle = self.router.clone().spawn(self.bus.subscribe());
        let request_id = uuid::Uuid::new_v4().to_string();

        match self.reconciler.initialize(&request_id).await {
            Ok(outcome) => {
                if let InitOutcome::Initialized { height } = outcome {
                    tracing::info!(request_id, height = ?height, "Sync engine started");
                }
                Ok(handle)
            }
            Err(e) => {
                handle.abort();
                tracing::error!(request_id, error = %e, "Startup reconciliation failed");
                Err(e)
            }
        }
    }

    /// Ingest one batch from the pipeline.
    pub async fn handle_batch(&self, batch: &BlockBatch) -> Result<BatchOutcome, SyncError> {
        self.ingestor.handle_batch(batch).await
    }

    /// Run reorg recovery against the current store state.
    pub async fn recover(&self, request_id: &str) -> Result<Option<u64>, SyncError> {
        self.recovery.recover(request_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.bus.subscribe()
    }

    pub fn query(&self) -> &QueryService {
        &self.query
    }

    pub fn metrics(&self) -> &SyncMetrics {
        self.ingestor.metrics()
    }
}
