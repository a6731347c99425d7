//! Provider engagement events (delivered/opened/clicked/bounced), keyed by
//! the provider's external delivery id.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{DeliveryAttempt, EngagementEvent, EngagementKind, StatusDetail};

use crate::ledger::DeliveryLedger;

pub struct EngagementRecorder {
    ledger: Arc<dyn DeliveryLedger>,
}

impl EngagementRecorder {
    pub fn new(ledger: Arc<dyn DeliveryLedger>) -> Self {
        Self { ledger }
    }

    /// Apply one event and return the attempt's resulting state.
    ///
    /// `delivered`/`bounced` move the attempt's status; a repeat of the status
    /// it already has is accepted without change. `opened`/`clicked` are only
    /// appended to the engagement history.
    pub async fn record(
        &self,
        external_id: &str,
        kind: EngagementKind,
        occurred_at: DateTime<Utc>,
    ) -> Result<DeliveryAttempt, AppError> {
        let mut attempt = self
            .ledger
            .find_by_external_id(external_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("No delivery with external id {}", external_id))
            })?;

        if let Some(target) = kind.target_status()
            && attempt.status != target
        {
            attempt = self
                .ledger
                .update_status(attempt.id, target, StatusDetail::default())
                .await?;
        }

        self.ledger
            .record_engagement(&EngagementEvent {
                id: Uuid::new_v4(),
                attempt_id: attempt.id,
                kind,
                occurred_at,
            })
            .await?;

        tracing::info!(
            attempt_id = %attempt.id,
            request_id = %attempt.request_id,
            external_id = %external_id,
            event = %kind,
            status = %attempt.status,
            "Engagement recorded"
        );
        Ok(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use herald_common::types::{
        Channel, DeliveryStatus, DispatchResult, NotificationRequest, NotificationType,
        RequestRecord,
    };
    use std::collections::BTreeMap;

    async fn sent_attempt(ledger: &MemoryLedger, external_id: &str) -> DeliveryAttempt {
        let request = NotificationRequest::new(NotificationType::LeadNew, "R1", BTreeMap::new());
        ledger
            .record_request(&RequestRecord {
                idempotency_key: request.effective_idempotency_key(),
                result: DispatchResult::new(request.id),
                cancelled: false,
                created_at: request.created_at,
                request: request.clone(),
            })
            .await
            .unwrap();
        let attempt = DeliveryAttempt::pending(request.id, Channel::Mail, 1);
        ledger.record(&attempt).await.unwrap();
        ledger
            .update_status(attempt.id, DeliveryStatus::Sent, StatusDetail::sent(external_id))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_delivered_moves_status_and_is_idempotent() {
        let ledger = Arc::new(MemoryLedger::new());
        let attempt = sent_attempt(&ledger, "em_1").await;
        let recorder = EngagementRecorder::new(ledger.clone());

        let updated = recorder
            .record("em_1", EngagementKind::Delivered, Utc::now())
            .await
            .unwrap();
        assert_eq!(updated.status, DeliveryStatus::Delivered);

        let again = recorder
            .record("em_1", EngagementKind::Delivered, Utc::now())
            .await
            .unwrap();
        assert_eq!(again.status, DeliveryStatus::Delivered);
        assert_eq!(ledger.list_engagements(attempt.request_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_opened_only_appends() {
        let ledger = Arc::new(MemoryLedger::new());
        let attempt = sent_attempt(&ledger, "em_2").await;
        let recorder = EngagementRecorder::new(ledger.clone());

        let after = recorder
            .record("em_2", EngagementKind::Opened, Utc::now())
            .await
            .unwrap();
        assert_eq!(after.status, DeliveryStatus::Sent);

        let events = ledger.list_engagements(attempt.request_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EngagementKind::Opened);
    }

    #[tokio::test]
    async fn test_bounce_after_delivery_is_rejected() {
        let ledger = Arc::new(MemoryLedger::new());
        sent_attempt(&ledger, "em_3").await;
        let recorder = EngagementRecorder::new(ledger.clone());

        recorder
            .record("em_3", EngagementKind::Delivered, Utc::now())
            .await
            .unwrap();
        let err = recorder
            .record("em_3", EngagementKind::Bounced, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_unknown_external_id() {
        let recorder = EngagementRecorder::new(Arc::new(MemoryLedger::new()));
        let err = recorder
            .record("nope", EngagementKind::Clicked, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
