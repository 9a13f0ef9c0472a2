//! Business handlers keyed by `(source, event_type)`.
//!
//! Handlers are resolved from the registry on every attempt, so a retry
//! after a restart finds the same code path as the original delivery.
//! Handlers may run more than once and must be idempotent.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::payloads::{GenerationJobEvent, PaymentEvent, ProviderEvent, TrainingJobEvent};
use crate::types::WebhookSource;

#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, event: ProviderEvent) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> WebhookHandler for FnHandler<F>
where
    F: Fn(ProviderEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: ProviderEvent) -> anyhow::Result<()> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn WebhookHandler>
where
    F: Fn(ProviderEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(WebhookSource, String), Arc<dyn WebhookHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        source: WebhookSource,
        event_type: impl Into<String>,
        handler: Arc<dyn WebhookHandler>,
    ) -> &mut Self {
        self.handlers.insert((source, event_type.into()), handler);
        self
    }

    pub fn resolve(&self, source: WebhookSource, event_type: &str) -> Option<Arc<dyn WebhookHandler>> {
        self.handlers
            .get(&(source, event_type.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Marketplace side effects triggered by webhooks. Implementations live
/// with the data layer; each call must tolerate being repeated.
#[async_trait]
pub trait MarketplaceActions: Send + Sync {
    async fn mark_order_paid(&self, order_id: &str, session_id: &str) -> anyhow::Result<()>;

    async fn remove_watermark(&self, order_id: &str) -> anyhow::Result<()>;

    async fn trigger_royalty_transfer(&self, order_id: &str) -> anyhow::Result<()>;

    async fn update_transfer_status(
        &self,
        transfer_id: &str,
        status: &str,
    ) -> anyhow::Result<()>;

    async fn update_model_status(
        &self,
        job_id: &str,
        status: &str,
        artifact_url: Option<&str>,
        error: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn store_generation_artifacts(
        &self,
        request_id: &str,
        image_urls: &[String],
    ) -> anyhow::Result<()>;

    async fn fail_generation(&self, request_id: &str, error: &str) -> anyhow::Result<()>;
}

/// Actions that only log. Used when no data layer is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingActions;

#[async_trait]
impl MarketplaceActions for LoggingActions {
    async fn mark_order_paid(&self, order_id: &str, session_id: &str) -> anyhow::Result<()> {
        tracing::info!(order_id, session_id, "order marked paid");
        Ok(())
    }

    async fn remove_watermark(&self, order_id: &str) -> anyhow::Result<()> {
        tracing::info!(order_id, "watermark removal requested");
        Ok(())
    }

    async fn trigger_royalty_transfer(&self, order_id: &str) -> anyhow::Result<()> {
        tracing::info!(order_id, "royalty transfer requested");
        Ok(())
    }

    async fn update_transfer_status(
        &self,
        transfer_id: &str,
        status: &str,
    ) -> anyhow::Result<()> {
        tracing::info!(transfer_id, status, "transfer status updated");
        Ok(())
    }

    async fn update_model_status(
        &self,
        job_id: &str,
        status: &str,
        artifact_url: Option<&str>,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        tracing::info!(job_id, status, artifact_url, error, "creator model status updated");
        Ok(())
    }

    async fn store_generation_artifacts(
        &self,
        request_id: &str,
        image_urls: &[String],
    ) -> anyhow::Result<()> {
        tracing::info!(request_id, images = image_urls.len(), "generation artifacts stored");
        Ok(())
    }

    async fn fail_generation(&self, request_id: &str, error: &str) -> anyhow::Result<()> {
        tracing::info!(request_id, error, "generation marked failed");
        Ok(())
    }
}

fn unexpected(expected: &str, event: &ProviderEvent) -> anyhow::Error {
    anyhow::anyhow!(
        "{expected} handler received {} event from {}",
        event.event_type(),
        event.source()
    )
}

struct CheckoutCompleted(Arc<dyn MarketplaceActions>);

#[async_trait]
impl WebhookHandler for CheckoutCompleted {
    async fn handle(&self, event: ProviderEvent) -> anyhow::Result<()> {
        let ProviderEvent::Payment(PaymentEvent::CheckoutSessionCompleted {
            session_id,
            order_id,
            ..
        }) = &event
        else {
            return Err(unexpected("checkout", &event));
        };
        self.0.mark_order_paid(order_id, session_id).await?;
        self.0.remove_watermark(order_id).await?;
        self.0.trigger_royalty_transfer(order_id).await
    }
}

struct TransferChanged(Arc<dyn MarketplaceActions>);

#[async_trait]
impl WebhookHandler for TransferChanged {
    async fn handle(&self, event: ProviderEvent) -> anyhow::Result<()> {
        let ProviderEvent::Payment(PaymentEvent::TransferUpdated {
            transfer_id,
            status,
            event_type,
            ..
        }) = &event
        else {
            return Err(unexpected("transfer", &event));
        };
        let status = match (status.as_deref(), event_type.as_str()) {
            (Some(status), _) => status,
            (None, "transfer.reversed") => "reversed",
            (None, "transfer.created") => "created",
            (None, _) => "updated",
        };
        self.0.update_transfer_status(transfer_id, status).await
    }
}

struct TrainingFinished(Arc<dyn MarketplaceActions>);

#[async_trait]
impl WebhookHandler for TrainingFinished {
    async fn handle(&self, event: ProviderEvent) -> anyhow::Result<()> {
        let ProviderEvent::Training(TrainingJobEvent {
            job_id,
            artifact_url,
            error,
            ..
        }) = &event
        else {
            return Err(unexpected("training", &event));
        };
        let status = if event.event_type() == "training.completed" {
            "ready"
        } else {
            "failed"
        };
        self.0
            .update_model_status(job_id, status, artifact_url.as_deref(), error.as_deref())
            .await
    }
}

struct GenerationFinished(Arc<dyn MarketplaceActions>);

#[async_trait]
impl WebhookHandler for GenerationFinished {
    async fn handle(&self, event: ProviderEvent) -> anyhow::Result<()> {
        let ProviderEvent::Generation(GenerationJobEvent {
            request_id,
            image_urls,
            error,
            ..
        }) = &event
        else {
            return Err(unexpected("generation", &event));
        };
        if event.event_type() == "generation.completed" {
            if image_urls.is_empty() {
                anyhow::bail!("generation {request_id} completed without images");
            }
            self.0.store_generation_artifacts(request_id, image_urls).await
        } else {
            let error = error.as_deref().unwrap_or("generation failed");
            self.0.fail_generation(request_id, error).await
        }
    }
}

/// Registry wired with the marketplace's webhook handlers.
pub fn marketplace_registry(actions: Arc<dyn MarketplaceActions>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    registry.register(
        WebhookSource::Payment,
        "checkout.session.completed",
        Arc::new(CheckoutCompleted(actions.clone())),
    );
    let transfer: Arc<dyn WebhookHandler> = Arc::new(TransferChanged(actions.clone()));
    for event_type in ["transfer.created", "transfer.updated", "transfer.reversed"] {
        registry.register(WebhookSource::Payment, event_type, transfer.clone());
    }

    let training: Arc<dyn WebhookHandler> = Arc::new(TrainingFinished(actions.clone()));
    registry
        .register(
            WebhookSource::TrainingProviderA,
            "training.completed",
            training.clone(),
        )
        .register(WebhookSource::TrainingProviderA, "training.failed", training);

    let generation: Arc<dyn WebhookHandler> = Arc::new(GenerationFinished(actions));
    registry
        .register(
            WebhookSource::TrainingProviderB,
            "generation.completed",
            generation.clone(),
        )
        .register(WebhookSource::TrainingProviderB, "generation.failed", generation);

    registry
}
