//! Notification submission, status and cancellation routes.

use std::collections::{BTreeMap, BTreeSet};

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    Channel, ChannelOutcome, DeliveryAttempt, DispatchResult, EngagementEvent,
    NotificationRequest, NotificationType, Priority, ScheduledEntry,
};
use herald_engine::scheduler::CancelTarget;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", post(submit_notification))
        .route("/api/notifications/cancel", post(cancel_by_key))
        .route("/api/notifications/{id}", get(get_notification))
        .route("/api/notifications/{id}/cancel", post(cancel_notification))
}

/// Submission body. `type` and `channels` stay strings here so unknown values
/// surface as `invalid_payload` rather than a body rejection.
#[derive(Debug, Deserialize)]
pub struct SubmitNotification {
    #[serde(rename = "type")]
    pub notification_type: String,
    pub recipient_ref: String,
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
    pub channels: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Priority,
    pub send_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub override_quiet_hours: bool,
}

impl SubmitNotification {
    pub fn into_request(self) -> Result<NotificationRequest, AppError> {
        let notification_type: NotificationType = self
            .notification_type
            .parse()
            .map_err(AppError::InvalidPayload)?;

        if self.recipient_ref.trim().is_empty() {
            return Err(AppError::InvalidPayload("recipient_ref is required".into()));
        }

        let mut request = NotificationRequest::new(notification_type, self.recipient_ref, self.data)
            .with_priority(self.priority);

        if let Some(channels) = self.channels {
            let channels = channels
                .iter()
                .map(|c| c.parse::<Channel>())
                .collect::<Result<BTreeSet<_>, _>>()
                .map_err(AppError::InvalidPayload)?;
            if channels.is_empty() {
                return Err(AppError::InvalidPayload("channels must not be empty".into()));
            }
            request = request.with_channels(channels);
        }
        if let Some(send_at) = self.send_at {
            request = request.with_send_at(send_at);
        }
        if let Some(key) = self.idempotency_key.filter(|k| !k.trim().is_empty()) {
            request = request.with_idempotency_key(key);
        }
        if self.override_quiet_hours {
            request = request.with_quiet_hours_override();
        }
        Ok(request)
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub request_id: Uuid,
    pub duplicate: bool,
    pub outcomes: BTreeMap<Channel, ChannelOutcome>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub request: NotificationRequest,
    pub cancelled: bool,
    pub result: DispatchResult,
    pub scheduled: Option<ScheduledEntry>,
    pub attempts: Vec<DeliveryAttempt>,
    pub engagements: Vec<EngagementEvent>,
}

#[derive(Debug, Deserialize)]
pub struct CancelByKey {
    pub idempotency_key: String,
}

/// POST /api/notifications: validate and dispatch.
///
/// A duplicate within the dedup window returns the first request's result
/// with `duplicate: true`. The dispatch runs on its own task so a client
/// disconnect cannot cut it short.
async fn submit_notification(
    State(state): State<AppState>,
    Json(body): Json<SubmitNotification>,
) -> Result<Json<SubmitResponse>, AppError> {
    let request = body.into_request()?;
    let dispatcher = state.engine.dispatcher.clone();
    let receipt = tokio::spawn(async move { dispatcher.dispatch(request).await })
        .await
        .map_err(|e| AppError::Internal(format!("dispatch task failed: {}", e)))??;

    Ok(Json(SubmitResponse {
        request_id: receipt.result.request_id,
        duplicate: receipt.duplicate,
        outcomes: receipt.result.outcomes,
    }))
}

/// GET /api/notifications/{id}
async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StatusResponse>, AppError> {
    let status = state.engine.dispatcher.status(id).await?;

    Ok(Json(StatusResponse {
        request: status.record.request,
        cancelled: status.record.cancelled,
        result: status.record.result,
        scheduled: status.scheduled,
        attempts: status.attempts,
        engagements: status.engagements,
    }))
}

/// POST /api/notifications/{id}/cancel
///
/// `cancelled` is true when a pending scheduled dispatch was prevented.
async fn cancel_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let prevented = state
        .engine
        .dispatcher
        .cancel(CancelTarget::RequestId(id), Utc::now())
        .await?;
    Ok(Json(serde_json::json!({ "cancelled": prevented })))
}

/// POST /api/notifications/cancel
async fn cancel_by_key(
    State(state): State<AppState>,
    Json(body): Json<CancelByKey>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.idempotency_key.trim().is_empty() {
        return Err(AppError::InvalidPayload("idempotency_key is required".into()));
    }
    let prevented = state
        .engine
        .dispatcher
        .cancel(CancelTarget::IdempotencyKey(body.idempotency_key), Utc::now())
        .await?;
    Ok(Json(serde_json::json!({ "cancelled": prevented })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: serde_json::Value) -> SubmitNotification {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_into_request_maps_fields() {
        let request = body(json!({
            "type": "lead_hot",
            "recipient_ref": "R1",
            "data": {"lead_name": "Jane", "score": 92},
            "channels": ["SMS", "push"],
            "priority": "high",
            "idempotency_key": "lead-7"
        }))
        .into_request()
        .unwrap();

        assert_eq!(request.notification_type, NotificationType::LeadHot);
        assert_eq!(
            request.requested_channels,
            Some(BTreeSet::from([Channel::Sms, Channel::Push]))
        );
        assert_eq!(request.priority, Priority::High);
        assert_eq!(request.effective_idempotency_key(), "lead-7");
        assert!(!request.override_quiet_hours);
    }

    #[test]
    fn test_unknown_type_is_invalid_payload() {
        let err = body(json!({"type": "lead_cold", "recipient_ref": "R1"}))
            .into_request()
            .unwrap_err();
        match err {
            AppError::InvalidPayload(msg) => assert!(msg.contains("lead_cold")),
            other => panic!("expected InvalidPayload, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_channel_is_invalid_payload() {
        let err = body(json!({"type": "lead_new", "recipient_ref": "R1", "channels": ["fax"]}))
            .into_request()
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidPayload(_)));
    }

    #[test]
    fn test_blank_key_falls_back_to_derived() {
        let request = body(json!({
            "type": "emergency",
            "recipient_ref": "R1",
            "data": {"message": "Fire drill"},
            "idempotency_key": "  "
        }))
        .into_request()
        .unwrap();
        assert_eq!(request.idempotency_key, None);
        assert_eq!(request.effective_idempotency_key().len(), 64);
    }
}
