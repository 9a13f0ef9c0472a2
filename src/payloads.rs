//! Typed provider payloads.
//!
//! Each source has its own body shape. `ProviderEvent::parse` checks the
//! fields handlers rely on before anything is recorded or dispatched.

use serde::Deserialize;
use serde_json::Value;

use crate::error::PayloadError;
use crate::types::WebhookSource;

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Payment(PaymentEvent),
    Training(TrainingJobEvent),
    Generation(GenerationJobEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PaymentEvent {
    CheckoutSessionCompleted {
        event_id: String,
        session_id: String,
        order_id: String,
        amount_total: Option<i64>,
    },
    TransferUpdated {
        event_id: String,
        event_type: String,
        transfer_id: String,
        status: Option<String>,
        order_id: Option<String>,
    },
    Other {
        event_id: String,
        event_type: String,
    },
}

/// Training job status update from the training provider.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingJobEvent {
    pub job_id: String,
    pub status: String,
    pub model_id: Option<String>,
    pub artifact_url: Option<String>,
    pub error: Option<String>,
}

/// Image generation result from the generation provider.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationJobEvent {
    pub request_id: String,
    pub status: String,
    pub image_urls: Vec<String>,
    pub error: Option<String>,
}

#[derive(Deserialize)]
struct PaymentEnvelope {
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    #[serde(default)]
    data: Option<PaymentData>,
}

#[derive(Deserialize)]
struct PaymentData {
    #[serde(default)]
    object: Value,
}

#[derive(Deserialize)]
struct TrainingBody {
    id: Option<String>,
    status: Option<String>,
    model_id: Option<String>,
    #[serde(default)]
    output: Option<TrainingOutput>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct TrainingOutput {
    weights: Option<String>,
}

#[derive(Deserialize)]
struct GenerationBody {
    request_id: Option<String>,
    status: Option<String>,
    #[serde(default)]
    images: Vec<GeneratedImage>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct GeneratedImage {
    url: String,
}

fn required<T>(
    value: Option<T>,
    source: WebhookSource,
    field: &'static str,
) -> Result<T, PayloadError> {
    value.ok_or(PayloadError::MissingField {
        provider: source,
        field,
    })
}

fn str_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl ProviderEvent {
    /// Parse a raw request body for `source`.
    pub fn from_slice(source: WebhookSource, body: &[u8]) -> Result<(Self, Value), PayloadError> {
        let value: Value = serde_json::from_slice(body)?;
        let event = Self::parse(source, &value)?;
        Ok((event, value))
    }

    pub fn parse(source: WebhookSource, value: &Value) -> Result<Self, PayloadError> {
        match source {
            WebhookSource::Payment => parse_payment(value).map(ProviderEvent::Payment),
            WebhookSource::TrainingProviderA => parse_training(value).map(ProviderEvent::Training),
            WebhookSource::TrainingProviderB => {
                parse_generation(value).map(ProviderEvent::Generation)
            }
        }
    }

    pub fn source(&self) -> WebhookSource {
        match self {
            ProviderEvent::Payment(_) => WebhookSource::Payment,
            ProviderEvent::Training(_) => WebhookSource::TrainingProviderA,
            ProviderEvent::Generation(_) => WebhookSource::TrainingProviderB,
        }
    }

    /// Event name used for handler lookup and storage.
    pub fn event_type(&self) -> String {
        match self {
            ProviderEvent::Payment(PaymentEvent::CheckoutSessionCompleted { .. }) => {
                "checkout.session.completed".to_string()
            }
            ProviderEvent::Payment(
                PaymentEvent::TransferUpdated { event_type, .. }
                | PaymentEvent::Other { event_type, .. },
            ) => event_type.clone(),
            ProviderEvent::Training(job) => match job.status.as_str() {
                "succeeded" | "completed" => "training.completed".to_string(),
                "failed" | "canceled" => "training.failed".to_string(),
                other => format!("training.{other}"),
            },
            ProviderEvent::Generation(job) => match job.status.as_str() {
                "OK" | "COMPLETED" => "generation.completed".to_string(),
                "ERROR" | "FAILED" => "generation.failed".to_string(),
                other => format!("generation.{}", other.to_lowercase()),
            },
        }
    }

    /// The provider's identity for this delivery, used for deduplication.
    pub fn provider_event_id(&self) -> String {
        match self {
            ProviderEvent::Payment(
                PaymentEvent::CheckoutSessionCompleted { event_id, .. }
                | PaymentEvent::TransferUpdated { event_id, .. }
                | PaymentEvent::Other { event_id, .. },
            ) => event_id.clone(),
            ProviderEvent::Training(job) => format!("{}:{}", job.job_id, job.status),
            ProviderEvent::Generation(job) => format!("{}:{}", job.request_id, job.status),
        }
    }
}

fn parse_payment(value: &Value) -> Result<PaymentEvent, PayloadError> {
    let source = WebhookSource::Payment;
    let envelope = PaymentEnvelope::deserialize(value)?;
    let event_id = required(envelope.id, source, "id")?;
    let event_type = required(envelope.event_type, source, "type")?;
    let object = envelope.data.map(|d| d.object).unwrap_or(Value::Null);

    if event_type == "checkout.session.completed" {
        return Ok(PaymentEvent::CheckoutSessionCompleted {
            event_id,
            session_id: required(str_at(&object, "/id"), source, "data.object.id")?,
            order_id: required(
                str_at(&object, "/metadata/order_id"),
                source,
                "data.object.metadata.order_id",
            )?,
            amount_total: object.get("amount_total").and_then(Value::as_i64),
        });
    }

    if event_type.starts_with("transfer.") {
        return Ok(PaymentEvent::TransferUpdated {
            event_id,
            transfer_id: required(str_at(&object, "/id"), source, "data.object.id")?,
            status: str_at(&object, "/status"),
            order_id: str_at(&object, "/metadata/order_id"),
            event_type,
        });
    }

    Ok(PaymentEvent::Other {
        event_id,
        event_type,
    })
}

fn parse_training(value: &Value) -> Result<TrainingJobEvent, PayloadError> {
    let source = WebhookSource::TrainingProviderA;
    let body = TrainingBody::deserialize(value)?;
    Ok(TrainingJobEvent {
        job_id: required(body.id.filter(|s| !s.is_empty()), source, "id")?,
        status: required(body.status.filter(|s| !s.is_empty()), source, "status")?,
        model_id: body.model_id,
        artifact_url: body.output.and_then(|o| o.weights),
        error: body.error,
    })
}

fn parse_generation(value: &Value) -> Result<GenerationJobEvent, PayloadError> {
    let source = WebhookSource::TrainingProviderB;
    let body = GenerationBody::deserialize(value)?;
    Ok(GenerationJobEvent {
        request_id: required(
            body.request_id.filter(|s| !s.is_empty()),
            source,
            "request_id",
        )?,
        status: required(body.status.filter(|s| !s.is_empty()), source, "status")?,
        image_urls: body.images.into_iter().map(|i| i.url).collect(),
        error: body.error,
    })
}
