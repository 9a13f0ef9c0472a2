use serde::Serialize;
use std::sync::Arc;

use crate::error::StoreError;
use crate::retry::RetryManager;
use crate::store::WebhookEventStore;
use crate::types::{DeadLetterEntry, StatsFilter, WebhookEvent};

pub const MAX_LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_letter: u64,
    /// Percentage of events that completed, two decimals.
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterView {
    #[serde(flatten)]
    pub entry: DeadLetterEntry,
    pub event: Option<WebhookEvent>,
}

/// Read-only view over the event store for dashboards and admin tools.
#[derive(Clone)]
pub struct WebhookMonitor {
    store: Arc<dyn WebhookEventStore>,
    retry: RetryManager,
}

impl WebhookMonitor {
    pub fn new(store: Arc<dyn WebhookEventStore>, retry: RetryManager) -> Self {
        Self { store, retry }
    }

    pub async fn get_stats(&self, filter: &StatsFilter) -> Result<WebhookStats, StoreError> {
        let counts = self.store.count_by_status(filter).await?;
        let total = counts.total();
        let success_rate = if total == 0 {
            0.0
        } else {
            (counts.completed as f64 / total as f64 * 10_000.0).round() / 100.0
        };
        Ok(WebhookStats {
            total,
            pending: counts.pending,
            processing: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            dead_letter: counts.dead_letter,
            success_rate,
        })
    }

    pub async fn get_recent_failures(&self, limit: usize) -> Result<Vec<WebhookEvent>, StoreError> {
        self.store.recent_failures(clamp_limit(limit)).await
    }

    pub async fn get_dead_letter_queue(&self) -> Result<Vec<DeadLetterView>, StoreError> {
        let entries = self.store.dead_letters().await?;
        let mut views = Vec::with_capacity(entries.len());
        for entry in entries {
            let event = self.store.get(entry.webhook_event_id).await?;
            views.push(DeadLetterView { entry, event });
        }
        Ok(views)
    }

    pub async fn list_retryable(&self, limit: usize) -> Result<Vec<WebhookEvent>, StoreError> {
        self.retry.list_retryable(clamp_limit(limit)).await
    }
}

fn clamp_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_LIST_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::store::JsonFileStore;
    use crate::types::{NewWebhookEvent, WebhookSource, WebhookStatus};
    use serde_json::json;

    fn monitor_with_store() -> (WebhookMonitor, Arc<dyn WebhookEventStore>) {
        let store: Arc<dyn WebhookEventStore> = Arc::new(JsonFileStore::in_memory());
        let retry = RetryManager::new(
            store.clone(),
            RetryPolicy {
                max_retries: 1,
                ..RetryPolicy::default()
            },
        );
        (WebhookMonitor::new(store.clone(), retry), store)
    }

    async fn seed(store: &Arc<dyn WebhookEventStore>, source: WebhookSource, end: WebhookStatus) {
        let id = store
            .create(NewWebhookEvent::new(source, "test.event", json!({})))
            .await
            .unwrap()
            .event()
            .id;
        if end == WebhookStatus::Pending {
            return;
        }
        store.mark_processing(id).await.unwrap();
        let policy = RetryPolicy {
            max_retries: if end == WebhookStatus::DeadLetter { 1 } else { 3 },
            ..RetryPolicy::default()
        };
        match end {
            WebhookStatus::Completed => {
                store.mark_completed(id).await.unwrap();
            }
            WebhookStatus::Failed | WebhookStatus::DeadLetter => {
                store.record_failure(id, "boom", &policy).await.unwrap();
            }
            _ => {}
        }
    }

    #[tokio::test]
    async fn empty_store_yields_zeroes() {
        let (monitor, _) = monitor_with_store();
        let stats = monitor.get_stats(&StatsFilter::default()).await.unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert!(monitor.get_recent_failures(10).await.unwrap().is_empty());
        assert!(monitor.get_dead_letter_queue().await.unwrap().is_empty());
        assert!(monitor.list_retryable(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn counts_sum_to_total() {
        let (monitor, store) = monitor_with_store();
        use WebhookStatus::*;
        let fixture = [
            (WebhookSource::Payment, Completed),
            (WebhookSource::Payment, Completed),
            (WebhookSource::Payment, Failed),
            (WebhookSource::TrainingProviderA, DeadLetter),
            (WebhookSource::TrainingProviderA, Processing),
            (WebhookSource::TrainingProviderB, Pending),
            (WebhookSource::TrainingProviderB, Completed),
        ];
        for (source, status) in fixture {
            seed(&store, source, status).await;
        }

        let stats = monitor.get_stats(&StatsFilter::default()).await.unwrap();
        assert_eq!(stats.total, 7);
        assert_eq!(
            stats.completed + stats.failed + stats.dead_letter + stats.processing + stats.pending,
            stats.total
        );
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(stats.success_rate, 42.86);

        let payment = monitor
            .get_stats(&StatsFilter {
                source: Some(WebhookSource::Payment),
                ..StatsFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(payment.total, 3);
        assert_eq!(payment.success_rate, 66.67);

        let future = monitor
            .get_stats(&StatsFilter {
                from: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
                ..StatsFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(future.total, 0);
    }

    #[tokio::test]
    async fn dead_letter_queue_includes_event() {
        let (monitor, store) = monitor_with_store();
        seed(&store, WebhookSource::Payment, WebhookStatus::DeadLetter).await;
        seed(&store, WebhookSource::Payment, WebhookStatus::Failed).await;

        let dlq = monitor.get_dead_letter_queue().await.unwrap();
        assert_eq!(dlq.len(), 1);
        let event = dlq[0].event.as_ref().unwrap();
        assert_eq!(event.status, WebhookStatus::DeadLetter);
        assert_eq!(dlq[0].entry.final_error, "boom");

        assert_eq!(monitor.get_recent_failures(1).await.unwrap().len(), 1);
        assert_eq!(monitor.get_recent_failures(50).await.unwrap().len(), 2);
    }
}
