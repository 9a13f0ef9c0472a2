use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::verification::SignatureScheme;

/// External provider a webhook was delivered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookSource {
    Payment,
    TrainingProviderA,
    TrainingProviderB,
}

impl WebhookSource {
    pub const ALL: [WebhookSource; 3] = [
        WebhookSource::Payment,
        WebhookSource::TrainingProviderA,
        WebhookSource::TrainingProviderB,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookSource::Payment => "payment",
            WebhookSource::TrainingProviderA => "training_provider_a",
            WebhookSource::TrainingProviderB => "training_provider_b",
        }
    }

    /// Request header carrying the provider's signature.
    pub fn signature_header(&self) -> &'static str {
        match self {
            WebhookSource::Payment => "payment-signature",
            WebhookSource::TrainingProviderA => "x-training-signature-256",
            WebhookSource::TrainingProviderB => "x-generation-signature",
        }
    }

    pub fn signature_scheme(&self) -> SignatureScheme {
        match self {
            WebhookSource::Payment => SignatureScheme::TimestampedSha256,
            WebhookSource::TrainingProviderA => SignatureScheme::Sha256,
            WebhookSource::TrainingProviderB => SignatureScheme::Sha1,
        }
    }
}

impl fmt::Display for WebhookSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WebhookSource::ALL
            .into_iter()
            .find(|src| src.as_str() == s)
            .ok_or_else(|| format!("unknown webhook source: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Pending => "pending",
            WebhookStatus::Processing => "processing",
            WebhookStatus::Completed => "completed",
            WebhookStatus::Failed => "failed",
            WebhookStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WebhookStatus::Completed | WebhookStatus::DeadLetter)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: WebhookStatus) -> bool {
        use WebhookStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, DeadLetter)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound provider event as recorded in the event store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub source: WebhookSource,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_event_id: Option<String>,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub retry_count: u32,
    pub status: WebhookStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

/// Input to `WebhookEventStore::create`.
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub source: WebhookSource,
    pub event_type: String,
    pub provider_event_id: Option<String>,
    pub payload: serde_json::Value,
    pub signature: Option<String>,
}

impl NewWebhookEvent {
    pub fn new(
        source: WebhookSource,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            source,
            event_type: event_type.into(),
            provider_event_id: None,
            payload,
            signature: None,
        }
    }

    pub fn with_provider_event_id(mut self, id: impl Into<String>) -> Self {
        self.provider_event_id = Some(id.into());
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub(crate) fn into_event(self, now: DateTime<Utc>) -> WebhookEvent {
        WebhookEvent {
            id: Uuid::new_v4(),
            source: self.source,
            event_type: self.event_type,
            provider_event_id: self.provider_event_id,
            payload: self.payload,
            signature: self.signature,
            retry_count: 0,
            status: WebhookStatus::Pending,
            error_message: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }
}

/// Terminal-failure record for an event that exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub webhook_event_id: Uuid,
    pub final_error: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// Filter for monitor aggregates.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsFilter {
    pub source: Option<WebhookSource>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl StatsFilter {
    pub fn matches(&self, event: &WebhookEvent) -> bool {
        self.source.map_or(true, |s| s == event.source)
            && self.from.map_or(true, |from| event.created_at >= from)
            && self.to.map_or(true, |to| event.created_at <= to)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_letter: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: WebhookStatus) {
        match status {
            WebhookStatus::Pending => self.pending += 1,
            WebhookStatus::Processing => self.processing += 1,
            WebhookStatus::Completed => self.completed += 1,
            WebhookStatus::Failed => self.failed += 1,
            WebhookStatus::DeadLetter => self.dead_letter += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.dead_letter
    }
}
