use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ProcessError, StoreError};
use crate::retry::RetryManager;
use crate::store::{CreateOutcome, WebhookEventStore};
use crate::types::{NewWebhookEvent, WebhookEvent, WebhookStatus};

/// Result of a successful pass through the wrapper.
#[derive(Debug)]
pub enum Processed<T> {
    Completed { event_id: Uuid, value: T },
    /// The provider redelivered an event that is already completed,
    /// in flight, or dead-lettered; the handler was not run.
    Duplicate {
        event_id: Uuid,
        status: WebhookStatus,
    },
}

impl<T> Processed<T> {
    pub fn event_id(&self) -> Uuid {
        match self {
            Processed::Completed { event_id, .. } | Processed::Duplicate { event_id, .. } => {
                *event_id
            }
        }
    }
}

/// Single choke point for running webhook handlers with retry bookkeeping.
#[derive(Clone)]
pub struct WebhookProcessor {
    store: Arc<dyn WebhookEventStore>,
    retry: RetryManager,
}

impl WebhookProcessor {
    pub fn new(store: Arc<dyn WebhookEventStore>, retry: RetryManager) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &Arc<dyn WebhookEventStore> {
        &self.store
    }

    pub fn retry_manager(&self) -> &RetryManager {
        &self.retry
    }

    /// Record `incoming`, then run `handler` once.
    ///
    /// A handler error is counted against the event's retry budget and then
    /// returned unchanged as `ProcessError::Handler`.
    pub async fn process_with_retry<T, F, Fut>(
        &self,
        incoming: NewWebhookEvent,
        handler: F,
    ) -> Result<Processed<T>, ProcessError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let event = match self.store.create(incoming).await? {
            CreateOutcome::Created(event) => {
                tracing::info!(
                    event_id = %event.id,
                    source = %event.source,
                    event_type = %event.event_type,
                    "webhook event recorded"
                );
                event
            }
            CreateOutcome::Existing(event) => match event.status {
                WebhookStatus::Pending => event,
                WebhookStatus::Failed => self.retry.retry_webhook(event.id).await?,
                status => {
                    tracing::info!(
                        event_id = %event.id,
                        source = %event.source,
                        provider_event_id = ?event.provider_event_id,
                        %status,
                        "duplicate webhook delivery ignored"
                    );
                    return Ok(Processed::Duplicate {
                        event_id: event.id,
                        status,
                    });
                }
            },
        };

        self.reprocess(&event, handler).await
    }

    /// Run `handler` for an event that is already recorded and pending.
    ///
    /// Losing the claim to another worker yields `Processed::Duplicate`.
    pub async fn reprocess<T, F, Fut>(
        &self,
        event: &WebhookEvent,
        handler: F,
    ) -> Result<Processed<T>, ProcessError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let id = event.id;
        match self.store.mark_processing(id).await {
            Ok(_) => {}
            // A concurrent delivery or retry claimed the record first.
            Err(StoreError::InvalidTransition { from, .. }) => {
                tracing::info!(
                    event_id = %id,
                    status = %from,
                    "webhook already claimed, skipping handler"
                );
                return Ok(Processed::Duplicate {
                    event_id: id,
                    status: from,
                });
            }
            Err(e) => return Err(e.into()),
        }

        match handler().await {
            Ok(value) => {
                self.store.mark_completed(id).await?;
                tracing::info!(
                    event_id = %id,
                    source = %event.source,
                    event_type = %event.event_type,
                    "webhook processed"
                );
                Ok(Processed::Completed {
                    event_id: id,
                    value,
                })
            }
            Err(err) => {
                let message = format!("{err:#}");
                if let Err(store_err) = self.retry.mark_failed(id, &message).await {
                    tracing::error!(
                        event_id = %id,
                        error = %store_err,
                        handler_error = %message,
                        "failed to record webhook failure"
                    );
                }
                Err(ProcessError::Handler(err))
            }
        }
    }
}
