//! Batch retry of failed webhook events.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{ProcessError, StoreError};
use crate::handlers::HandlerRegistry;
use crate::payloads::ProviderEvent;
use crate::processor::{Processed, WebhookProcessor};
use crate::types::{WebhookEvent, WebhookStatus};

pub const STALE_PROCESSING_ERROR: &str = "processing timed out";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryRunSummary {
    pub processed_count: usize,
    pub succeeded_count: usize,
    pub failed_count: usize,
    /// Stuck `processing` records moved back into the failure path.
    pub reclaimed_count: usize,
    /// Stuck `pending` records dispatched again.
    pub resumed_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAttempt {
    Succeeded,
    Failed,
    /// Another worker already moved the record on.
    Skipped,
}

#[derive(Clone)]
pub struct RetryProcessor {
    processor: WebhookProcessor,
    registry: Arc<HandlerRegistry>,
    batch_size: usize,
    stale_after: Duration,
}

impl RetryProcessor {
    pub fn new(
        processor: WebhookProcessor,
        registry: Arc<HandlerRegistry>,
        batch_size: usize,
        stale_after: Duration,
    ) -> Self {
        Self {
            processor,
            registry,
            batch_size: batch_size.max(1),
            stale_after,
        }
    }

    pub async fn process_retryable_webhooks(&self) -> Result<RetryRunSummary, StoreError> {
        let mut summary = RetryRunSummary {
            reclaimed_count: self.reclaim_stale().await?,
            ..RetryRunSummary::default()
        };

        let mut attempts = Vec::new();
        for event in self.stale_pending().await? {
            summary.resumed_count += 1;
            attempts.push(self.dispatch(&event).await);
        }
        let retry = self.processor.retry_manager();
        for event in retry.list_retryable(self.batch_size).await? {
            attempts.push(self.retry_event(&event).await);
        }

        for attempt in attempts {
            match attempt {
                RetryAttempt::Succeeded => {
                    summary.processed_count += 1;
                    summary.succeeded_count += 1;
                }
                RetryAttempt::Failed => {
                    summary.processed_count += 1;
                    summary.failed_count += 1;
                }
                RetryAttempt::Skipped => {}
            }
        }

        if summary.processed_count > 0 || summary.reclaimed_count > 0 {
            tracing::info!(
                processed = summary.processed_count,
                succeeded = summary.succeeded_count,
                failed = summary.failed_count,
                reclaimed = summary.reclaimed_count,
                resumed = summary.resumed_count,
                "retry run finished"
            );
        }
        Ok(summary)
    }

    /// Retry a single failed event now, regardless of cooldown.
    pub async fn retry_one(&self, id: Uuid) -> Result<RetryAttempt, StoreError> {
        let event = self
            .processor
            .store()
            .get(id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let pending = self.processor.retry_manager().retry_webhook(event.id).await?;
        Ok(self.dispatch(&pending).await)
    }

    async fn retry_event(&self, event: &WebhookEvent) -> RetryAttempt {
        match self.processor.retry_manager().retry_webhook(event.id).await {
            Ok(pending) => self.dispatch(&pending).await,
            Err(StoreError::InvalidTransition { .. }) => {
                tracing::debug!(event_id = %event.id, "retry already claimed elsewhere");
                RetryAttempt::Skipped
            }
            Err(e) => {
                tracing::error!(event_id = %event.id, error = %e, "failed to reset webhook for retry");
                RetryAttempt::Failed
            }
        }
    }

    /// Run the registry handler for a pending event.
    async fn dispatch(&self, event: &WebhookEvent) -> RetryAttempt {
        let registry = self.registry.clone();
        let source = event.source;
        let event_type = event.event_type.clone();
        let payload = event.payload.clone();

        let result = self
            .processor
            .reprocess(event, || async move {
                let parsed = ProviderEvent::parse(source, &payload)?;
                let handler = registry.resolve(source, &event_type).ok_or_else(|| {
                    anyhow::anyhow!("no handler registered for {source} {event_type}")
                })?;
                handler.handle(parsed).await
            })
            .await;

        match result {
            Ok(Processed::Completed { .. }) => RetryAttempt::Succeeded,
            Ok(Processed::Duplicate { .. }) => RetryAttempt::Skipped,
            Err(ProcessError::Handler(e)) => {
                tracing::debug!(event_id = %event.id, error = %e, "retry attempt failed");
                RetryAttempt::Failed
            }
            Err(ProcessError::Store(StoreError::InvalidTransition { .. })) => RetryAttempt::Skipped,
            Err(ProcessError::Store(e)) => {
                tracing::error!(event_id = %event.id, error = %e, "store error during retry");
                RetryAttempt::Failed
            }
        }
    }

    async fn reclaim_stale(&self) -> Result<usize, StoreError> {
        let Ok(stale_after) = chrono::Duration::from_std(self.stale_after) else {
            return Ok(0);
        };
        let store = self.processor.store();
        let stale = store
            .list_stale(WebhookStatus::Processing, Utc::now() - stale_after)
            .await?;
        let mut reclaimed = 0;
        for event in stale {
            match self
                .processor
                .retry_manager()
                .mark_failed(event.id, STALE_PROCESSING_ERROR)
                .await
            {
                Ok(_) => reclaimed += 1,
                Err(StoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }

    /// Pending records nobody picked up, e.g. after a crash between the
    /// reset to pending and dispatch.
    async fn stale_pending(&self) -> Result<Vec<WebhookEvent>, StoreError> {
        let Ok(stale_after) = chrono::Duration::from_std(self.stale_after) else {
            return Ok(Vec::new());
        };
        let mut stale = self
            .processor
            .store()
            .list_stale(WebhookStatus::Pending, Utc::now() - stale_after)
            .await?;
        stale.truncate(self.batch_size);
        Ok(stale)
    }

    /// Run the processor every `interval` until `shutdown` flips to true.
    pub fn spawn_schedule(
        self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.process_retryable_webhooks().await {
                            tracing::error!(error = %e, "scheduled retry run failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("retry schedule stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}
