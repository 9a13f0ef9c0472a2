use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, Request},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::config::SecretsConfig;
use crate::error::{ApiError, ApiResult};
use crate::handlers::HandlerRegistry;
use crate::monitor::WebhookMonitor;
use crate::payloads::ProviderEvent;
use crate::processor::{Processed, WebhookProcessor};
use crate::retry_worker::RetryProcessor;
use crate::types::{NewWebhookEvent, StatsFilter, WebhookSource};

/// Everything the routes need; cheap to clone.
#[derive(Clone)]
pub struct ServerState {
    pub processor: WebhookProcessor,
    pub registry: Arc<HandlerRegistry>,
    pub monitor: WebhookMonitor,
    pub retry_processor: RetryProcessor,
    pub secrets: Arc<SecretsConfig>,
    pub admin_token: Option<Arc<str>>,
}

/// Build the full router: provider webhooks plus, when a token is set,
/// the admin surface.
pub fn router(state: ServerState) -> Router {
    let mut app = Router::new()
        .route("/webhooks/payment", post(payment_webhook))
        .route("/webhooks/training", post(training_webhook))
        .route("/webhooks/generation", post(generation_webhook))
        .route("/health", get(health));

    if state.admin_token.is_some() {
        let admin = Router::new()
            .route("/stats", get(admin_stats))
            .route("/failures", get(admin_failures))
            .route("/dead-letter", get(admin_dead_letter))
            .route("/dead-letter/{id}/review", post(admin_review_dead_letter))
            .route("/retryable", get(admin_retryable))
            .route("/retry-all", post(admin_retry_all))
            .route("/{id}/retry", post(admin_retry_one))
            .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));
        app = app.nest("/admin/webhooks", admin);
    } else {
        tracing::warn!("no admin token configured; admin webhook routes disabled");
    }

    app.with_state(state)
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve(
    addr: &str,
    state: ServerState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "webhook HTTP server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ─── Provider routes ─────────────────────────────────────────────────────────

async fn payment_webhook(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    receive(&state, WebhookSource::Payment, &headers, &body).await
}

async fn training_webhook(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    receive(&state, WebhookSource::TrainingProviderA, &headers, &body).await
}

async fn generation_webhook(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    receive(&state, WebhookSource::TrainingProviderB, &headers, &body).await
}

/// Verify, parse, record and dispatch one provider delivery.
async fn receive(
    state: &ServerState,
    source: WebhookSource,
    headers: &HeaderMap,
    body: &[u8],
) -> ApiResult<Json<Value>> {
    let header_name = source.signature_header();
    let signature = headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(ApiError::MissingSignature(header_name))?;

    let secret = state.secrets.for_source(source).ok_or_else(|| {
        tracing::error!(%source, "webhook secret not configured");
        ApiError::SourceNotConfigured(source)
    })?;

    let verification = source.signature_scheme().verify(body, signature, secret);
    if !verification.is_valid {
        let reason = verification
            .error
            .unwrap_or_else(|| "signature mismatch".to_string());
        tracing::warn!(%source, reason = %reason, "webhook signature rejected");
        return Err(ApiError::InvalidSignature(reason));
    }

    let (event, payload) = ProviderEvent::from_slice(source, body).map_err(|e| {
        tracing::warn!(%source, error = %e, "webhook payload rejected");
        ApiError::from(e)
    })?;
    let event_type = event.event_type();

    let Some(handler) = state.registry.resolve(source, &event_type) else {
        tracing::debug!(%source, %event_type, "no handler for webhook event type, acknowledging");
        return Ok(Json(json!({ "received": true, "ignored": true })));
    };

    let incoming = NewWebhookEvent::new(source, event_type, payload)
        .with_provider_event_id(event.provider_event_id())
        .with_signature(signature);

    match state
        .processor
        .process_with_retry(incoming, || handler.handle(event))
        .await
    {
        Ok(Processed::Completed { event_id, .. }) => {
            Ok(Json(json!({ "received": true, "event_id": event_id })))
        }
        Ok(Processed::Duplicate { event_id, status }) => Ok(Json(json!({
            "received": true,
            "duplicate": true,
            "event_id": event_id,
            "status": status,
        }))),
        Err(e) => {
            tracing::error!(%source, error = %e, "webhook handler failed");
            Err(e.into())
        }
    }
}

// ─── Admin routes ────────────────────────────────────────────────────────────

async fn require_admin(
    State(state): State<ServerState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = state.admin_token.as_deref().ok_or(ApiError::Unauthorized)?;
    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        tracing::warn!("admin request with invalid token");
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

/// `{success, data, message}` envelope used by every admin response.
#[derive(Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    data: T,
    message: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data,
        message: None,
    })
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    source: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ReviewRequest {
    note: String,
}

async fn admin_stats(
    State(state): State<ServerState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<Envelope<crate::monitor::WebhookStats>>> {
    let source = query
        .source
        .as_deref()
        .map(str::parse::<WebhookSource>)
        .transpose()
        .map_err(ApiError::Validation)?;
    let filter = StatsFilter {
        source,
        from: query.from,
        to: query.to,
    };
    Ok(ok(state.monitor.get_stats(&filter).await?))
}

async fn admin_failures(
    State(state): State<ServerState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Envelope<Value>>> {
    let failures = state
        .monitor
        .get_recent_failures(query.limit.unwrap_or(20))
        .await?;
    Ok(ok(json!({ "count": failures.len(), "events": failures })))
}

async fn admin_dead_letter(State(state): State<ServerState>) -> ApiResult<Json<Envelope<Value>>> {
    let entries = state.monitor.get_dead_letter_queue().await?;
    Ok(ok(json!({ "count": entries.len(), "entries": entries })))
}

async fn admin_retryable(
    State(state): State<ServerState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Envelope<Value>>> {
    let events = state
        .monitor
        .list_retryable(query.limit.unwrap_or(20))
        .await?;
    Ok(ok(json!({ "count": events.len(), "events": events })))
}

async fn admin_retry_one(
    State(state): State<ServerState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Value>>> {
    let attempt = state.retry_processor.retry_one(id).await?;
    let event = state.processor.store().get(id).await?;
    tracing::info!(event_id = %id, ?attempt, "manual webhook retry");
    Ok(ok(json!({ "attempt": format!("{attempt:?}").to_lowercase(), "event": event })))
}

async fn admin_retry_all(
    State(state): State<ServerState>,
) -> ApiResult<Json<Envelope<crate::retry_worker::RetryRunSummary>>> {
    Ok(ok(state.retry_processor.process_retryable_webhooks().await?))
}

async fn admin_review_dead_letter(
    State(state): State<ServerState>,
    Path(id): Path<Uuid>,
    Json(review): Json<ReviewRequest>,
) -> ApiResult<Json<Envelope<crate::types::DeadLetterEntry>>> {
    let note = review.note.trim();
    if note.is_empty() {
        return Err(ApiError::Validation("review note must not be empty".into()));
    }
    let entry = state
        .processor
        .store()
        .annotate_dead_letter(id, note)
        .await?;
    Ok(ok(entry))
}
