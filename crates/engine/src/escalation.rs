//! Escalation sinks for attempts that ran out of retries.
//!
//! This is the one place the engine reports its own failures outward.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{Channel, NotificationType};

/// Redis list holding dead-lettered deliveries.
pub const DEAD_LETTER_KEY: &str = "notifications:dead_letter";

/// Everything an alerting consumer needs to follow up on a lost delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub request_id: Uuid,
    pub attempt_id: Uuid,
    pub channel: Channel,
    pub attempt_number: i32,
    pub notification_type: NotificationType,
    pub recipient_ref: String,
    pub last_error: String,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn escalate(&self, escalation: &Escalation) -> Result<(), AppError>;
}

/// Logs exhausted deliveries at error level.
#[derive(Debug, Default)]
pub struct LogEscalation;

#[async_trait]
impl EscalationSink for LogEscalation {
    async fn escalate(&self, escalation: &Escalation) -> Result<(), AppError> {
        tracing::error!(
            request_id = %escalation.request_id,
            attempt_id = %escalation.attempt_id,
            channel = %escalation.channel,
            attempt_number = escalation.attempt_number,
            recipient_ref = %escalation.recipient_ref,
            last_error = %escalation.last_error,
            "Delivery retries exhausted"
        );
        Ok(())
    }
}

/// Pushes a JSON record onto the Redis dead-letter list, and logs like [`LogEscalation`].
pub struct RedisEscalation {
    redis: ConnectionManager,
    key: String,
}

impl RedisEscalation {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            key: DEAD_LETTER_KEY.to_string(),
        }
    }
}

#[async_trait]
impl EscalationSink for RedisEscalation {
    async fn escalate(&self, escalation: &Escalation) -> Result<(), AppError> {
        LogEscalation.escalate(escalation).await?;

        let body = serde_json::to_string(escalation)
            .map_err(|e| AppError::Internal(format!("Failed to encode escalation: {}", e)))?;

        let mut redis = self.redis.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.key)
            .arg(body)
            .query_async(&mut redis)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_record_shape() {
        let escalation = Escalation {
            request_id: Uuid::nil(),
            attempt_id: Uuid::nil(),
            channel: Channel::Sms,
            attempt_number: 3,
            notification_type: NotificationType::AppointmentReminder,
            recipient_ref: "R2".to_string(),
            last_error: "HTTP 503".to_string(),
            occurred_at: Utc::now(),
        };
        let json = serde_json::to_value(&escalation).unwrap();
        assert_eq!(json["channel"], "sms");
        assert_eq!(json["notification_type"], "appointment_reminder");
        assert_eq!(json["attempt_number"], 3);
    }

    #[tokio::test]
    async fn test_log_sink_never_fails() {
        let escalation = Escalation {
            request_id: Uuid::new_v4(),
            attempt_id: Uuid::new_v4(),
            channel: Channel::Mail,
            attempt_number: 3,
            notification_type: NotificationType::LeadNew,
            recipient_ref: "R1".to_string(),
            last_error: "timed out".to_string(),
            occurred_at: Utc::now(),
        };
        assert!(LogEscalation.escalate(&escalation).await.is_ok());
    }
}
