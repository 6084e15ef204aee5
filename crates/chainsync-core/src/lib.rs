//! chainsync-core — coordination core of an event-sourced blockchain follower.
//!
//! # Architecture
//!
//! ```text
//! SyncEngine
//!   ├── StartupReconciler  (resume height, operator conflict prompt)
//!   ├── BatchIngestor      (one atomic commit per batch)
//!   │     ├── Rehydrator   (network + read models from the EventStore)
//!   │     └── ReorgRecovery (network walk-back, model truncation)
//!   ├── EventBus           (committed NetworkEvents)
//!   └── SagaRouter         (events → FetchPipeline commands)
//! ```

pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod network;
pub mod prompt;
pub mod query;
pub mod reconcile;
pub mod recovery;
pub mod rehydrate;
pub mod retry;
pub mod saga;
pub mod source;
pub mod store;
pub mod tracker;
pub mod types;

pub use bus::EventBus;
pub use config::{RetryConfig, SyncConfig, SyncConfigBuilder};
pub use engine::{EngineParts, SyncEngine};
pub use error::SyncError;
pub use event::NetworkEvent;
pub use ingest::{BatchIngestor, BatchOutcome};
pub use metrics::SyncMetrics;
pub use model::{BlockContext, ModelEvent, ModelInstance, ModelRegistry, ReadModel};
pub use network::{Network, NetworkCommit};
pub use prompt::ConsolePrompt;
pub use query::{ModelSnapshot, QueryService};
pub use reconcile::{resolve_start_height, InitOutcome, Initializer, StartDecision, StartupReconciler};
pub use recovery::ReorgRecovery;
pub use rehydrate::Rehydrator;
pub use retry::RetryPolicy;
pub use saga::SagaRouter;
pub use source::{BlockSource, ConfirmPrompt, FetchPipeline, FixedPrompt};
pub use store::{AggregateCommit, AggregateInfo, EventQuery, EventStore, MemoryEventStore, NewEvent, Snapshot, StoredEvent};
pub use tracker::BlockWindow;
pub use types::{Block, BlockBatch};
