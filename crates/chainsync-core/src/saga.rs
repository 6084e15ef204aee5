//! Saga router: turn domain events from the bus into commands for the
//! fetch pipeline.
//!
//! | event          | action                                      |
//! |----------------|---------------------------------------------|
//! | `Initialized`  | `pipeline.start(height)`                    |
//! | `BlocksAdded`  | `pipeline.confirm(hashes)`                  |
//! | `Reorganized`  | `pipeline.reorganize(height)`               |
//! | `Cleared`      | `initializer.initialize(new request id)`    |
//!
//! Actions are at-least-once: a failed action is retried with backoff, and
//! every target must tolerate repeats.

use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::event::NetworkEvent;
use crate::reconcile::Initializer;
use crate::retry::RetryPolicy;
use crate::source::FetchPipeline;

pub struct SagaRouter {
    pipeline: Arc<dyn FetchPipeline>,
    initializer: Arc<dyn Initializer>,
    retry: RetryPolicy,
}

impl SagaRouter {
    pub fn new(
        pipeline: Arc<dyn FetchPipeline>,
        initializer: Arc<dyn Initializer>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            pipeline,
            initializer,
            retry,
        }
    }

    /// Run the action for `event` once.
    pub async fn route(&self, event: &NetworkEvent) -> Result<(), SyncError> {
        match event {
            NetworkEvent::Initialized { height, .. } => self.pipeline.start(*height).await,
            NetworkEvent::BlocksAdded { blocks, .. } => {
                let hashes: Vec<String> = blocks.iter().map(|b| b.hash.clone()).collect();
                self.pipeline.confirm(&hashes).await
            }
            NetworkEvent::Reorganized { height, .. } => self.pipeline.reorganize(*height).await,
            NetworkEvent::Cleared { .. } => {
                let request_id = uuid::Uuid::new_v4().to_string();
                self.initializer.initialize(&request_id).await.map(|_| ())
            }
        }
    }

    /// Run the action for `event`, retrying retryable failures with backoff.
    pub async fn dispatch(&self, event: &NetworkEvent) -> Result<(), SyncError> {
        let mut attempt = 0;
        loop {
            match self.route(event).await {
                Ok(()) => {
                    tracing::debug!(event = %event, attempt, "Saga action done");
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    let Some(delay) = self.retry.next_delay(attempt) else {
                        return Err(e);
                    };
                    tracing::warn!(
                        event = %event,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Saga action failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Consume `rx` until the bus closes.
    ///
    /// Failed actions are logged and skipped. A cancellation stops the router
    /// and is returned, since it means the operator refused to continue.
    pub async fn run(&self, mut rx: broadcast::Receiver<NetworkEvent>) -> Result<(), SyncError> {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = self.dispatch(&event).await {
                        tracing::error!(
                            event = %event,
                            request_id = event.request_id(),
                            error = %e,
                            "Saga action failed"
                        );
                        if matches!(e, SyncError::Cancelled { .. }) {
                            return Err(e);
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Saga router lagged behind the event bus");
                }
                Err(RecvError::Closed) => {
                    tracing::debug!("Event bus closed, saga router stopping");
                    return Ok(());
                }
            }
        }
    }

    pub fn spawn(
        self: Arc<Self>,
        rx: broadcast::Receiver<NetworkEvent>,
    ) -> JoinHandle<Result<(), SyncError>> {
        tokio::spawn(async move { self.run(rx).await })
    }
}
