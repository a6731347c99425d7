//! Integration tests for API routes.
//!
//! Uses `tower::ServiceExt` to test Axum routes without a real HTTP server.
//! The engine runs on the in-memory ledger with a stub mail adapter, so no
//! external services are needed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use herald_api::routes::create_router;
use herald_api::state::AppState;
use herald_common::config::EngineConfig;
use herald_common::types::{Channel, RenderedPayload};
use herald_engine::Engine;
use herald_engine::escalation::LogEscalation;
use herald_engine::ledger::MemoryLedger;
use herald_engine::preferences::{RecipientPreference, StaticPreferenceResolver};
use herald_engine::scheduler::Scheduler;
use herald_notifier::{ChannelRegistry, ProviderAdapter, ProviderError};

// ============================================================
// Helpers
// ============================================================

/// Mail adapter that accepts everything and echoes the correlation id.
struct AcceptingMail;

#[async_trait]
impl ProviderAdapter for AcceptingMail {
    fn channel(&self) -> Channel {
        Channel::Mail
    }

    fn name(&self) -> &'static str {
        "accepting"
    }

    async fn send(
        &self,
        _address: &str,
        _payload: &RenderedPayload,
        correlation_id: Uuid,
        _timeout: Duration,
    ) -> Result<String, ProviderError> {
        Ok(format!("em_{}", correlation_id.simple()))
    }
}

fn app() -> Router {
    let config = EngineConfig::default();
    let resolver = StaticPreferenceResolver::new().with(
        RecipientPreference::new("R1").with_channel(Channel::Mail, "agent@example.com"),
    );
    let registry = ChannelRegistry::new().with_adapter(Arc::new(AcceptingMail), None);

    let engine = Engine::new(
        &config,
        Arc::new(MemoryLedger::new()),
        Arc::new(resolver),
        Arc::new(registry),
        Arc::new(LogEscalation),
        Scheduler::new(&config),
    );
    create_router(AppState::new(engine))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn lead_new(extra: Value) -> Value {
    let mut body = json!({
        "type": "lead_new",
        "recipient_ref": "R1",
        "data": {"lead_name": "Jane Doe", "lead_source": "website"},
    });
    if let (Some(target), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        target.extend(extra.clone());
    }
    body
}

// ============================================================
// Health
// ============================================================

#[tokio::test]
async fn test_health() {
    let app = app();
    let (status, body) = send(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "herald-api");
    assert_eq!(body["channels"], json!(["mail"]));
}

// ============================================================
// Submission
// ============================================================

#[tokio::test]
async fn test_submit_and_query_status() {
    let app = app();
    let (status, body) = send(&app, "POST", "/api/notifications", Some(lead_new(json!({})))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["duplicate"], false);
    assert_eq!(body["outcomes"]["mail"]["status"], "sent");
    let request_id = body["request_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "GET", &format!("/api/notifications/{}", request_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["request"]["type"], "lead_new");
    assert_eq!(body["cancelled"], false);
    assert_eq!(body["attempts"].as_array().unwrap().len(), 1);
    assert_eq!(body["attempts"][0]["status"], "sent");
    assert_eq!(body["attempts"][0]["attempt_number"], 1);
}

#[tokio::test]
async fn test_duplicate_submission() {
    let app = app();
    let payload = lead_new(json!({"idempotency_key": "lead-42"}));

    let (_, first) = send(&app, "POST", "/api/notifications", Some(payload.clone())).await;
    let (status, second) = send(&app, "POST", "/api/notifications", Some(payload)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["duplicate"], true);
    assert_eq!(second["request_id"], first["request_id"]);
    assert_eq!(second["outcomes"], first["outcomes"]);
}

#[tokio::test]
async fn test_missing_field_is_bad_request() {
    let app = app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/notifications",
        Some(json!({
            "type": "lead_new",
            "recipient_ref": "R1",
            "data": {"lead_name": "Jane Doe"}
        })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_payload");
    assert!(body["error"].as_str().unwrap().contains("lead_source"));
}

#[tokio::test]
async fn test_unknown_type_is_bad_request() {
    let app = app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/notifications",
        Some(json!({"type": "newsletter", "recipient_ref": "R1"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_payload");
}

#[tokio::test]
async fn test_no_eligible_channel_is_unprocessable() {
    let app = app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/notifications",
        Some(lead_new(json!({"channels": ["sms"]}))),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "no_eligible_channel");
}

#[tokio::test]
async fn test_unknown_request_is_not_found() {
    let app = app();
    let (status, body) = send(
        &app,
        "GET",
        &format!("/api/notifications/{}", Uuid::new_v4()),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

// ============================================================
// Cancellation
// ============================================================

#[tokio::test]
async fn test_cancel_scheduled_by_key() {
    let app = app();
    let send_at = chrono::Utc::now() + chrono::Duration::hours(2);
    let (_, submitted) = send(
        &app,
        "POST",
        "/api/notifications",
        Some(lead_new(json!({"send_at": send_at, "idempotency_key": "later-1"}))),
    )
    .await;
    assert_eq!(submitted["outcomes"]["mail"]["status"], "deferred");
    let request_id = submitted["request_id"].as_str().unwrap().to_string();

    let (_, before) = send(&app, "GET", &format!("/api/notifications/{}", request_id), None).await;
    assert_eq!(before["scheduled"]["reason"], "explicit_delay");

    let (status, body) = send(
        &app,
        "POST",
        "/api/notifications/cancel",
        Some(json!({"idempotency_key": "later-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], true);

    let (_, after) = send(&app, "GET", &format!("/api/notifications/{}", request_id), None).await;
    assert_eq!(after["cancelled"], true);
    assert!(after["scheduled"].is_null());
}

#[tokio::test]
async fn test_cancel_after_send_prevents_nothing() {
    let app = app();
    let (_, submitted) = send(&app, "POST", "/api/notifications", Some(lead_new(json!({})))).await;
    let request_id = submitted["request_id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/notifications/{}/cancel", request_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], false);
}

#[tokio::test]
async fn test_cancel_unknown_is_not_found() {
    let app = app();
    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/notifications/{}/cancel", Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================
// Engagement webhook
// ============================================================

#[tokio::test]
async fn test_engagement_webhook() {
    let app = app();
    let (_, submitted) = send(&app, "POST", "/api/notifications", Some(lead_new(json!({})))).await;
    let request_id = submitted["request_id"].as_str().unwrap().to_string();
    let external_id = submitted["outcomes"]["mail"]["external_id"]
        .as_str()
        .unwrap()
        .to_string();

    let (status, body) = send(
        &app,
        "POST",
        "/api/webhooks/engagement",
        Some(json!({"external_id": external_id, "event": "delivered"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "delivered");

    let (status, _) = send(
        &app,
        "POST",
        "/api/webhooks/engagement",
        Some(json!({"external_id": external_id, "event": "opened"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Bounce after delivery is an invalid transition
    let (status, body) = send(
        &app,
        "POST",
        "/api/webhooks/engagement",
        Some(json!({"external_id": external_id, "event": "bounced"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_transition");

    let (_, status_body) = send(&app, "GET", &format!("/api/notifications/{}", request_id), None).await;
    let engagements: BTreeMap<String, usize> = status_body["engagements"]
        .as_array()
        .unwrap()
        .iter()
        .fold(BTreeMap::new(), |mut acc, e| {
            *acc.entry(e["kind"].as_str().unwrap().to_string()).or_default() += 1;
            acc
        });
    assert_eq!(
        engagements,
        BTreeMap::from([("delivered".to_string(), 1), ("opened".to_string(), 1)])
    );
}

#[tokio::test]
async fn test_engagement_for_unknown_delivery() {
    let app = app();
    let (status, _) = send(
        &app,
        "POST",
        "/api/webhooks/engagement",
        Some(json!({"external_id": "em_missing", "event": "clicked"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
