use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use marketplace_webhooks::config::SecretsConfig;
use marketplace_webhooks::handlers::{handler_fn, HandlerRegistry};
use marketplace_webhooks::http_server::{router, ServerState};
use marketplace_webhooks::monitor::WebhookMonitor;
use marketplace_webhooks::retry_worker::RetryProcessor;
use marketplace_webhooks::store::{JsonFileStore, WebhookEventStore};
use marketplace_webhooks::types::StatsFilter;
use marketplace_webhooks::verification::{sign_sha1, sign_sha256, sign_timestamped};
use marketplace_webhooks::{RetryManager, RetryPolicy, WebhookProcessor, WebhookSource, WebhookStatus};

const PAYMENT_SECRET: &str = "whsec_test";
const TRAINING_SECRET: &str = "training_secret";
const GENERATION_SECRET: &str = "generation_secret";
const ADMIN_TOKEN: &str = "admin-secret";

struct Harness {
    app: Router,
    store: Arc<dyn WebhookEventStore>,
    retry_processor: RetryProcessor,
    calls: Arc<AtomicU32>,
}

fn harness(fail_first: u32, admin_token: Option<&str>) -> Harness {
    harness_with_secrets(
        fail_first,
        admin_token,
        SecretsConfig {
            payment: Some(PAYMENT_SECRET.to_string()),
            training_provider_a: Some(TRAINING_SECRET.to_string()),
            training_provider_b: Some(GENERATION_SECRET.to_string()),
        },
    )
}

/// Handlers for every provider that count calls; the payment handler
/// fails its first `fail_first` invocations.
fn harness_with_secrets(
    fail_first: u32,
    admin_token: Option<&str>,
    secrets: SecretsConfig,
) -> Harness {
    let store: Arc<dyn WebhookEventStore> = Arc::new(JsonFileStore::in_memory());
    let retry = RetryManager::new(
        store.clone(),
        RetryPolicy {
            backoff: vec![Duration::ZERO],
            cooldown: Duration::ZERO,
            ..RetryPolicy::default()
        },
    );
    let processor = WebhookProcessor::new(store.clone(), retry.clone());

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut registry = HandlerRegistry::new();
    registry.register(
        WebhookSource::Payment,
        "checkout.session.completed",
        handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < fail_first {
                    anyhow::bail!("order service unavailable");
                }
                Ok(())
            }
        }),
    );
    let counter = calls.clone();
    registry.register(
        WebhookSource::TrainingProviderA,
        "training.completed",
        handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );
    let counter = calls.clone();
    registry.register(
        WebhookSource::TrainingProviderB,
        "generation.completed",
        handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );
    let registry = Arc::new(registry);

    let retry_processor = RetryProcessor::new(
        processor.clone(),
        registry.clone(),
        10,
        Duration::from_secs(600),
    );
    let state = ServerState {
        processor,
        registry,
        monitor: WebhookMonitor::new(store.clone(), retry),
        retry_processor: retry_processor.clone(),
        secrets: Arc::new(secrets),
        admin_token: admin_token.map(Arc::from),
    };

    Harness {
        app: router(state),
        store,
        retry_processor,
        calls,
    }
}

fn checkout_body(event_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "data": {"object": {"id": "cs_123", "amount_total": 4200, "metadata": {"order_id": "ord_9"}}}
    }))
    .unwrap()
}

fn payment_request(body: Vec<u8>, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/payment")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header("payment-signature", signature);
    }
    builder.body(Body::from(body)).unwrap()
}

fn signed_payment(body: Vec<u8>) -> Request<Body> {
    let signature = sign_timestamped(&body, PAYMENT_SECRET, Utc::now().timestamp());
    payment_request(body, Some(signature))
}

fn admin_request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn total_events(store: &Arc<dyn WebhookEventStore>) -> u64 {
    store
        .count_by_status(&StatsFilter::default())
        .await
        .unwrap()
        .total()
}

#[tokio::test]
async fn valid_payment_webhook_completes() {
    let h = harness(0, None);

    let (status, body) = send(&h.app, signed_payment(checkout_body("evt_a"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], true);

    let id = body["event_id"].as_str().unwrap().parse().unwrap();
    let event = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(event.status, WebhookStatus::Completed);
    assert_eq!(event.provider_event_id.as_deref(), Some("evt_a"));
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_signature_is_rejected_without_record() {
    let h = harness(0, None);

    let (status, body) = send(&h.app, payment_request(checkout_body("evt_b"), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "missing_signature");
    assert_eq!(total_events(&h.store).await, 0);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_signature_never_reaches_handler() {
    let h = harness(0, None);
    let body = checkout_body("evt_c");
    let forged = sign_timestamped(&body, "not-the-secret", Utc::now().timestamp());

    let (status, response) = send(&h.app, payment_request(body, Some(forged))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"], "invalid_signature");
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    assert_eq!(total_events(&h.store).await, 0);
}

#[tokio::test]
async fn stale_timestamp_is_rejected() {
    let h = harness(0, None);
    let body = checkout_body("evt_old");
    let signature = sign_timestamped(&body, PAYMENT_SECRET, Utc::now().timestamp() - 3600);

    let (status, _) = send(&h.app, payment_request(body, Some(signature))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn repeated_handler_failure_ends_in_dead_letter() {
    let h = harness(u32::MAX, Some(ADMIN_TOKEN));

    let (status, body) = send(&h.app, signed_payment(checkout_body("evt_d"))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "handler_error");

    h.retry_processor.process_retryable_webhooks().await.unwrap();
    h.retry_processor.process_retryable_webhooks().await.unwrap();
    assert_eq!(h.calls.load(Ordering::SeqCst), 3);

    let (status, body) = send(
        &h.app,
        admin_request("GET", "/admin/webhooks/dead-letter", Some(ADMIN_TOKEN)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["count"], 1);
    let entry = &body["data"]["entries"][0];
    assert_eq!(entry["final_error"], "order service unavailable");
    assert_eq!(entry["event"]["status"], "dead_letter");
    assert_eq!(entry["event"]["retry_count"], 3);

    // Exhausted events are no longer picked up.
    let summary = h.retry_processor.process_retryable_webhooks().await.unwrap();
    assert_eq!(summary.processed_count, 0);
    assert_eq!(h.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn redelivered_event_is_acknowledged_once() {
    let h = harness(0, None);

    let (_, first) = send(&h.app, signed_payment(checkout_body("evt_dup"))).await;
    let (status, second) = send(&h.app, signed_payment(checkout_body("evt_dup"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["duplicate"], true);
    assert_eq!(second["event_id"], first["event_id"]);
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    assert_eq!(total_events(&h.store).await, 1);
}

#[tokio::test]
async fn unhandled_event_type_is_ignored() {
    let h = harness(0, None);
    let body = serde_json::to_vec(&json!({"id": "evt_x", "type": "customer.created", "data": {"object": {}}}))
        .unwrap();

    let (status, response) = send(&h.app, signed_payment(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["ignored"], true);
    assert_eq!(total_events(&h.store).await, 0);
}

#[tokio::test]
async fn malformed_payloads_are_bad_requests() {
    let h = harness(0, None);

    let (status, _) = send(&h.app, signed_payment(b"not json".to_vec())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing_order = serde_json::to_vec(&json!({
        "id": "evt_m",
        "type": "checkout.session.completed",
        "data": {"object": {"id": "cs_1"}}
    }))
    .unwrap();
    let (status, body) = send(&h.app, signed_payment(missing_order)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_payload");
    assert_eq!(total_events(&h.store).await, 0);
}

#[tokio::test]
async fn training_webhook_uses_sha256_scheme() {
    let h = harness(0, None);
    let body = serde_json::to_vec(&json!({
        "id": "job_1",
        "status": "succeeded",
        "output": {"weights": "https://cdn.example/w.safetensors"}
    }))
    .unwrap();

    let request = |signature: String| {
        Request::builder()
            .method("POST")
            .uri("/webhooks/training")
            .header("x-training-signature-256", signature)
            .body(Body::from(body.clone()))
            .unwrap()
    };

    let (status, _) = send(&h.app, request(sign_sha1(&body, TRAINING_SECRET))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, response) = send(&h.app, request(sign_sha256(&body, TRAINING_SECRET))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(response["event_id"].is_string());
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn generation_webhook_uses_sha1_scheme() {
    let h = harness(0, None);
    let body = serde_json::to_vec(&json!({
        "request_id": "req_1",
        "status": "OK",
        "images": [{"url": "https://cdn.example/1.png"}]
    }))
    .unwrap();

    let request = |signature: String| {
        Request::builder()
            .method("POST")
            .uri("/webhooks/generation")
            .header("x-generation-signature", signature)
            .body(Body::from(body.clone()))
            .unwrap()
    };

    let (status, _) = send(&h.app, request(sign_sha1(&body, "wrong_secret"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);

    let (status, response) = send(&h.app, request(sign_sha1(&body, GENERATION_SECRET))).await;
    assert_eq!(status, StatusCode::OK);
    let id = response["event_id"].as_str().unwrap().parse().unwrap();
    let event = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(event.status, WebhookStatus::Completed);
    assert_eq!(event.source, WebhookSource::TrainingProviderB);
    assert_eq!(event.event_type, "generation.completed");
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unconfigured_source_is_unavailable() {
    let h = harness_with_secrets(
        0,
        None,
        SecretsConfig {
            payment: Some(PAYMENT_SECRET.to_string()),
            ..SecretsConfig::default()
        },
    );
    let body = serde_json::to_vec(&json!({"request_id": "r1", "status": "OK"})).unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/generation")
        .header("x-generation-signature", sign_sha1(&body, "anything"))
        .body(Body::from(body))
        .unwrap();

    let (status, response) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response["error"], "source_not_configured");
}

#[tokio::test]
async fn admin_routes_require_bearer_token() {
    let h = harness(0, Some(ADMIN_TOKEN));

    let (status, _) = send(&h.app, admin_request("GET", "/admin/webhooks/stats", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(
        &h.app,
        admin_request("GET", "/admin/webhooks/stats", Some("wrong")),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    send(&h.app, signed_payment(checkout_body("evt_s"))).await;
    let (status, body) = send(
        &h.app,
        admin_request("GET", "/admin/webhooks/stats?source=payment", Some(ADMIN_TOKEN)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["completed"], 1);
    assert_eq!(body["data"]["success_rate"], 100.0);

    let (status, _) = send(
        &h.app,
        admin_request("GET", "/admin/webhooks/stats?source=fax", Some(ADMIN_TOKEN)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_routes_absent_without_token() {
    let h = harness(0, None);
    let (status, _) = send(
        &h.app,
        admin_request("GET", "/admin/webhooks/stats", Some(ADMIN_TOKEN)),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_retry_recovers_failed_event() {
    let h = harness(1, Some(ADMIN_TOKEN));

    let (status, _) = send(&h.app, signed_payment(checkout_body("evt_r"))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let failed = h.store.recent_failures(1).await.unwrap();
    let id = failed[0].id;

    let (status, body) = send(
        &h.app,
        admin_request("POST", &format!("/admin/webhooks/{id}/retry"), Some(ADMIN_TOKEN)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["attempt"], "succeeded");
    assert_eq!(body["data"]["event"]["status"], "completed");
    assert_eq!(body["data"]["event"]["retry_count"], 1);

    // Completed events cannot be retried again.
    let (status, _) = send(
        &h.app,
        admin_request("POST", &format!("/admin/webhooks/{id}/retry"), Some(ADMIN_TOKEN)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn dead_letter_review_note_is_stored() {
    let h = harness(u32::MAX, Some(ADMIN_TOKEN));
    send(&h.app, signed_payment(checkout_body("evt_n"))).await;
    let (status, body) = send(
        &h.app,
        admin_request("POST", "/admin/webhooks/retry-all", Some(ADMIN_TOKEN)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["failed_count"], 1);
    h.retry_processor.process_retryable_webhooks().await.unwrap();

    let id = h.store.dead_letters().await.unwrap()[0].webhook_event_id;
    let request = Request::builder()
        .method("POST")
        .uri(format!("/admin/webhooks/dead-letter/{id}/review"))
        .header("authorization", format!("Bearer {ADMIN_TOKEN}"))
        .header("content-type", "application/json")
        .body(Body::from(r#"{"note":"refunded manually"}"#))
        .unwrap();
    let (status, body) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["review_note"], "refunded manually");
    assert!(body["data"]["reviewed_at"].is_string());
}
