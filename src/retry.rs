//! Retry policy and dead-letter escalation.
//!
//! The policy itself is pure; `RetryManager` applies it to stored events.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::WebhookEventStore;
use crate::types::{WebhookEvent, WebhookStatus};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(15),
];
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures allowed before an event is dead-lettered.
    pub max_retries: u32,
    /// Delay before the n-th retry; the last entry repeats.
    pub backoff: Vec<Duration>,
    /// Global floor between a failure and its pickup by the retry processor.
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF.to_vec(),
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// What to do with an event after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    Retry { retry_count: u32, delay: Duration },
    DeadLetter { retry_count: u32 },
}

impl FailureDecision {
    pub fn retry_count(&self) -> u32 {
        match self {
            FailureDecision::Retry { retry_count, .. }
            | FailureDecision::DeadLetter { retry_count } => *retry_count,
        }
    }

    pub fn status(&self) -> WebhookStatus {
        match self {
            FailureDecision::Retry { .. } => WebhookStatus::Failed,
            FailureDecision::DeadLetter { .. } => WebhookStatus::DeadLetter,
        }
    }
}

impl RetryPolicy {
    /// Delay for the given 1-based attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let idx = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(idx)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    pub fn decide(&self, current_retry_count: u32) -> FailureDecision {
        let retry_count = current_retry_count.saturating_add(1);
        if retry_count >= self.max_retries {
            FailureDecision::DeadLetter {
                retry_count: retry_count.min(self.max_retries),
            }
        } else {
            FailureDecision::Retry {
                retry_count,
                delay: self.delay_for(retry_count),
            }
        }
    }
}

/// Disposition reported back to callers of `mark_failed`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailureOutcome {
    pub should_retry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub retry_count: u32,
    pub status: WebhookStatus,
}

impl FailureOutcome {
    pub fn from_decision(decision: &FailureDecision) -> Self {
        match *decision {
            FailureDecision::Retry { retry_count, delay } => Self {
                should_retry: true,
                retry_after_ms: Some(delay.as_millis() as u64),
                retry_count,
                status: WebhookStatus::Failed,
            },
            FailureDecision::DeadLetter { retry_count } => Self {
                should_retry: false,
                retry_after_ms: None,
                retry_count,
                status: WebhookStatus::DeadLetter,
            },
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

/// Drives events through failure, retry and dead-letter states.
#[derive(Clone)]
pub struct RetryManager {
    store: Arc<dyn WebhookEventStore>,
    policy: RetryPolicy,
}

impl RetryManager {
    pub fn new(store: Arc<dyn WebhookEventStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<FailureOutcome, StoreError> {
        let outcome = self.store.record_failure(id, error, &self.policy).await?;
        if outcome.should_retry {
            tracing::warn!(
                event_id = %id,
                retry_count = outcome.retry_count,
                retry_after_ms = ?outcome.retry_after_ms,
                error,
                "webhook processing failed, scheduled for retry"
            );
        } else {
            tracing::error!(
                target: "dlq",
                event_id = %id,
                retry_count = outcome.retry_count,
                error,
                "webhook moved to dead letter queue"
            );
        }
        Ok(outcome)
    }

    /// Put a failed event back to pending so it can be processed again.
    pub async fn retry_webhook(&self, id: Uuid) -> Result<WebhookEvent, StoreError> {
        let event = self.store.reset_to_pending(id).await?;
        tracing::info!(event_id = %id, retry_count = event.retry_count, "webhook reset to pending");
        Ok(event)
    }

    pub async fn list_retryable(&self, max_batch: usize) -> Result<Vec<WebhookEvent>, StoreError> {
        self.store
            .list_retryable(
                max_batch,
                self.policy.cooldown,
                self.policy.max_retries,
                Utc::now(),
            )
            .await
    }
}
