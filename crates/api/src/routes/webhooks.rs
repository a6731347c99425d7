//! Provider engagement webhook.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{DeliveryStatus, EngagementKind};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/webhooks/engagement", post(record_engagement))
}

#[derive(Debug, Deserialize)]
pub struct EngagementWebhook {
    pub external_id: String,
    pub event: EngagementKind,
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct EngagementResponse {
    pub attempt_id: Uuid,
    pub status: DeliveryStatus,
}

/// POST /api/webhooks/engagement
///
/// Unknown external ids are 404; a bounce after delivery is 409.
async fn record_engagement(
    State(state): State<AppState>,
    Json(body): Json<EngagementWebhook>,
) -> Result<Json<EngagementResponse>, AppError> {
    let attempt = state
        .engine
        .engagement
        .record(
            &body.external_id,
            body.event,
            body.occurred_at.unwrap_or_else(Utc::now),
        )
        .await?;

    Ok(Json(EngagementResponse {
        attempt_id: attempt.id,
        status: attempt.status,
    }))
}
