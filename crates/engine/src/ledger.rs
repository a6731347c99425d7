//! Delivery ledger, the single writer-of-record for requests, attempts and
//! engagement events.
//!
//! Every component goes through [`DeliveryLedger`]. Implementations serialize
//! writes per attempt id and enforce the attempt invariants:
//! - status moves only along `DeliveryStatus::can_transition_to`
//! - at most one `pending` attempt per (request, channel)
//! - attempt numbers strictly increase per (request, channel)

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    DeliveryAttempt, DeliveryStatus, DispatchResult, EngagementEvent, FailureKind, RequestRecord,
    StatusDetail,
};

#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    async fn record_request(&self, record: &RequestRecord) -> Result<(), AppError>;

    async fn update_request_result(
        &self,
        request_id: Uuid,
        result: &DispatchResult,
    ) -> Result<(), AppError>;

    async fn get_request(&self, request_id: Uuid) -> Result<Option<RequestRecord>, AppError>;

    /// Most recent request with this key created no earlier than `now - within`.
    async fn find_by_idempotency_key(
        &self,
        key: &str,
        within: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<RequestRecord>, AppError>;

    /// Flag a request as cancelled. Returns `false` if it does not exist.
    async fn mark_cancelled(&self, request_id: Uuid) -> Result<bool, AppError>;

    /// Insert a new attempt. Rejects a second pending attempt or a
    /// non-increasing attempt number for the same (request, channel).
    async fn record(&self, attempt: &DeliveryAttempt) -> Result<(), AppError>;

    /// Move an attempt to `status`, rejecting transitions outside the partial order.
    async fn update_status(
        &self,
        attempt_id: Uuid,
        status: DeliveryStatus,
        detail: StatusDetail,
    ) -> Result<DeliveryAttempt, AppError>;

    /// Flag a still-pending attempt as abandoned by the request timeout.
    async fn mark_timed_out(
        &self,
        attempt_id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Result<DeliveryAttempt, AppError>;

    /// Turn a transient failure into `failed(permanent: retries_exhausted)`.
    async fn mark_exhausted(&self, attempt_id: Uuid) -> Result<DeliveryAttempt, AppError>;

    /// Set or clear when the retry supervisor should look at an attempt.
    async fn set_next_retry(
        &self,
        attempt_id: Uuid,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError>;

    /// Attempts due for retry (transient failures and timed-out pendings),
    /// oldest first. Claimed rows have `next_retry_at` pushed to `now + lease`
    /// so a crashed worker's claims become due again.
    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>, AppError>;

    async fn get_attempt(&self, attempt_id: Uuid) -> Result<Option<DeliveryAttempt>, AppError>;

    /// All attempts of a request, ordered by channel then attempt number.
    async fn list_attempts(&self, request_id: Uuid) -> Result<Vec<DeliveryAttempt>, AppError>;

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<DeliveryAttempt>, AppError>;

    async fn record_engagement(&self, event: &EngagementEvent) -> Result<(), AppError>;

    async fn list_engagements(&self, request_id: Uuid) -> Result<Vec<EngagementEvent>, AppError>;
}

/// Apply a validated status change to an attempt in place.
pub(crate) fn apply_status(
    attempt: &mut DeliveryAttempt,
    status: DeliveryStatus,
    detail: StatusDetail,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    if !attempt.status.can_transition_to(status) {
        return Err(AppError::InvalidTransition {
            from: attempt.status,
            to: status,
        });
    }

    attempt.status = status;
    if detail.external_id.is_some() {
        attempt.external_delivery_id = detail.external_id;
    }
    if detail.error.is_some() {
        attempt.error_reason = detail.error;
    }
    if detail.failure_kind.is_some() {
        attempt.failure_kind = detail.failure_kind;
    }
    attempt.next_retry_at = detail.next_retry_at;
    attempt.updated_at = now;
    Ok(())
}

/// Whether the retry supervisor owns this attempt.
pub(crate) fn is_retryable(attempt: &DeliveryAttempt) -> bool {
    match attempt.status {
        DeliveryStatus::Failed => attempt.failure_kind == Some(FailureKind::Transient),
        DeliveryStatus::Pending => attempt.timed_out,
        _ => false,
    }
}

#[derive(Default)]
struct LedgerState {
    requests: HashMap<Uuid, RequestRecord>,
    attempts: HashMap<Uuid, DeliveryAttempt>,
    engagements: Vec<EngagementEvent>,
}

impl LedgerState {
    fn attempt_mut(&mut self, attempt_id: Uuid) -> Result<&mut DeliveryAttempt, AppError> {
        self.attempts
            .get_mut(&attempt_id)
            .ok_or_else(|| AppError::NotFound(format!("Delivery attempt {} not found", attempt_id)))
    }
}

/// Process-local ledger. One mutex guards all state, so every write is
/// serialized, not only writes to the same attempt.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DeliveryLedger for MemoryLedger {
    async fn record_request(&self, record: &RequestRecord) -> Result<(), AppError> {
        let mut state = self.state();
        if state.requests.contains_key(&record.request.id) {
            return Err(AppError::Conflict(format!(
                "Request {} already recorded",
                record.request.id
            )));
        }
        state.requests.insert(record.request.id, record.clone());
        Ok(())
    }

    async fn update_request_result(
        &self,
        request_id: Uuid,
        result: &DispatchResult,
    ) -> Result<(), AppError> {
        let mut state = self.state();
        let record = state
            .requests
            .get_mut(&request_id)
            .ok_or_else(|| AppError::NotFound(format!("Request {} not found", request_id)))?;
        record.result = result.clone();
        Ok(())
    }

    async fn get_request(&self, request_id: Uuid) -> Result<Option<RequestRecord>, AppError> {
        Ok(self.state().requests.get(&request_id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
        within: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<RequestRecord>, AppError> {
        let cutoff = now - within;
        Ok(self
            .state()
            .requests
            .values()
            .filter(|r| r.idempotency_key == key && r.created_at >= cutoff)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn mark_cancelled(&self, request_id: Uuid) -> Result<bool, AppError> {
        let mut state = self.state();
        match state.requests.get_mut(&request_id) {
            Some(record) => {
                record.cancelled = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record(&self, attempt: &DeliveryAttempt) -> Result<(), AppError> {
        let mut state = self.state();

        if !state.requests.contains_key(&attempt.request_id) {
            return Err(AppError::NotFound(format!(
                "Request {} not found",
                attempt.request_id
            )));
        }

        let siblings = state
            .attempts
            .values()
            .filter(|a| a.request_id == attempt.request_id && a.channel == attempt.channel);

        let mut highest = 0;
        for sibling in siblings {
            if sibling.status == DeliveryStatus::Pending && attempt.status == DeliveryStatus::Pending {
                return Err(AppError::Conflict(format!(
                    "Attempt {} on {} is still pending",
                    sibling.attempt_number, attempt.channel
                )));
            }
            highest = highest.max(sibling.attempt_number);
        }

        if attempt.attempt_number <= highest {
            return Err(AppError::Conflict(format!(
                "Attempt number {} on {} is not above {}",
                attempt.attempt_number, attempt.channel, highest
            )));
        }

        state.attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        attempt_id: Uuid,
        status: DeliveryStatus,
        detail: StatusDetail,
    ) -> Result<DeliveryAttempt, AppError> {
        let mut state = self.state();
        let attempt = state.attempt_mut(attempt_id)?;
        apply_status(attempt, status, detail, Utc::now())?;
        Ok(attempt.clone())
    }

    async fn mark_timed_out(
        &self,
        attempt_id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Result<DeliveryAttempt, AppError> {
        let mut state = self.state();
        let attempt = state.attempt_mut(attempt_id)?;
        if attempt.status != DeliveryStatus::Pending {
            return Err(AppError::Conflict(format!(
                "Attempt {} is {}, not pending",
                attempt_id, attempt.status
            )));
        }
        attempt.timed_out = true;
        attempt.next_retry_at = Some(next_retry_at);
        attempt.updated_at = Utc::now();
        Ok(attempt.clone())
    }

    async fn mark_exhausted(&self, attempt_id: Uuid) -> Result<DeliveryAttempt, AppError> {
        let mut state = self.state();
        let attempt = state.attempt_mut(attempt_id)?;
        if attempt.status != DeliveryStatus::Failed
            || attempt.failure_kind != Some(FailureKind::Transient)
        {
            return Err(AppError::Conflict(format!(
                "Attempt {} is not a transient failure",
                attempt_id
            )));
        }
        attempt.failure_kind = Some(FailureKind::Permanent);
        attempt.error_reason = Some(DeliveryAttempt::RETRIES_EXHAUSTED.to_string());
        attempt.next_retry_at = None;
        attempt.updated_at = Utc::now();
        Ok(attempt.clone())
    }

    async fn set_next_retry(
        &self,
        attempt_id: Uuid,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        let mut state = self.state();
        let attempt = state.attempt_mut(attempt_id)?;
        attempt.next_retry_at = next_retry_at;
        attempt.updated_at = Utc::now();
        Ok(())
    }

    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>, AppError> {
        let mut state = self.state();

        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .attempts
            .values()
            .filter(|a| is_retryable(a))
            .filter_map(|a| a.next_retry_at.filter(|at| *at <= now).map(|at| (at, a.id)))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(attempt) = state.attempts.get_mut(&id) {
                claimed.push(attempt.clone());
                attempt.next_retry_at = Some(now + lease);
            }
        }
        Ok(claimed)
    }

    async fn get_attempt(&self, attempt_id: Uuid) -> Result<Option<DeliveryAttempt>, AppError> {
        Ok(self.state().attempts.get(&attempt_id).cloned())
    }

    async fn list_attempts(&self, request_id: Uuid) -> Result<Vec<DeliveryAttempt>, AppError> {
        let mut attempts: Vec<DeliveryAttempt> = self
            .state()
            .attempts
            .values()
            .filter(|a| a.request_id == request_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| (a.channel, a.attempt_number));
        Ok(attempts)
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<DeliveryAttempt>, AppError> {
        Ok(self
            .state()
            .attempts
            .values()
            .filter(|a| a.external_delivery_id.as_deref() == Some(external_id))
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    async fn record_engagement(&self, event: &EngagementEvent) -> Result<(), AppError> {
        let mut state = self.state();
        if !state.attempts.contains_key(&event.attempt_id) {
            return Err(AppError::NotFound(format!(
                "Delivery attempt {} not found",
                event.attempt_id
            )));
        }
        state.engagements.push(event.clone());
        Ok(())
    }

    async fn list_engagements(&self, request_id: Uuid) -> Result<Vec<EngagementEvent>, AppError> {
        let state = self.state();
        let mut events: Vec<EngagementEvent> = state
            .engagements
            .iter()
            .filter(|e| {
                state
                    .attempts
                    .get(&e.attempt_id)
                    .is_some_and(|a| a.request_id == request_id)
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| e.occurred_at);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::types::{Channel, NotificationRequest, NotificationType};
    use std::collections::BTreeMap;

    async fn seeded() -> (MemoryLedger, Uuid) {
        let ledger = MemoryLedger::new();
        let request = NotificationRequest::new(NotificationType::LeadNew, "R1", BTreeMap::new())
            .with_idempotency_key("k1");
        let id = request.id;
        ledger
            .record_request(&RequestRecord {
                idempotency_key: "k1".to_string(),
                result: DispatchResult::new(id),
                cancelled: false,
                created_at: request.created_at,
                request,
            })
            .await
            .unwrap();
        (ledger, id)
    }

    #[tokio::test]
    async fn test_status_transitions_are_enforced() {
        let (ledger, request_id) = seeded().await;
        let attempt = DeliveryAttempt::pending(request_id, Channel::Mail, 1);
        ledger.record(&attempt).await.unwrap();

        let sent = ledger
            .update_status(attempt.id, DeliveryStatus::Sent, StatusDetail::sent("em_1"))
            .await
            .unwrap();
        assert_eq!(sent.external_delivery_id.as_deref(), Some("em_1"));

        ledger
            .update_status(attempt.id, DeliveryStatus::Delivered, StatusDetail::default())
            .await
            .unwrap();

        let err = ledger
            .update_status(attempt.id, DeliveryStatus::Pending, StatusDetail::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: DeliveryStatus::Delivered,
                to: DeliveryStatus::Pending
            }
        ));
    }

    #[tokio::test]
    async fn test_single_pending_per_channel() {
        let (ledger, request_id) = seeded().await;
        ledger
            .record(&DeliveryAttempt::pending(request_id, Channel::Sms, 1))
            .await
            .unwrap();

        let err = ledger
            .record(&DeliveryAttempt::pending(request_id, Channel::Sms, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        // Another channel is independent
        ledger
            .record(&DeliveryAttempt::pending(request_id, Channel::Mail, 1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_attempt_numbers_must_increase() {
        let (ledger, request_id) = seeded().await;
        let first = DeliveryAttempt::pending(request_id, Channel::Sms, 1);
        ledger.record(&first).await.unwrap();
        ledger
            .update_status(first.id, DeliveryStatus::Failed, StatusDetail::transient("503", None))
            .await
            .unwrap();

        let err = ledger
            .record(&DeliveryAttempt::pending(request_id, Channel::Sms, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        ledger
            .record(&DeliveryAttempt::pending(request_id, Channel::Sms, 2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_attempt_requires_known_request() {
        let ledger = MemoryLedger::new();
        let err = ledger
            .record(&DeliveryAttempt::pending(Uuid::new_v4(), Channel::Mail, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_idempotency_lookup_respects_window() {
        let (ledger, request_id) = seeded().await;
        let created = ledger.get_request(request_id).await.unwrap().unwrap().created_at;

        let hit = ledger
            .find_by_idempotency_key("k1", Duration::minutes(5), created + Duration::minutes(4))
            .await
            .unwrap();
        assert_eq!(hit.map(|r| r.request.id), Some(request_id));

        let miss = ledger
            .find_by_idempotency_key("k1", Duration::minutes(5), created + Duration::minutes(6))
            .await
            .unwrap();
        assert!(miss.is_none());

        let other = ledger
            .find_by_idempotency_key("k2", Duration::minutes(5), created)
            .await
            .unwrap();
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn test_claim_due_retries_leases_rows() {
        let (ledger, request_id) = seeded().await;
        let now = Utc::now();

        let attempt = DeliveryAttempt::pending(request_id, Channel::Push, 1);
        ledger.record(&attempt).await.unwrap();
        ledger
            .update_status(
                attempt.id,
                DeliveryStatus::Failed,
                StatusDetail::transient("503", Some(now - Duration::seconds(1))),
            )
            .await
            .unwrap();

        let claimed = ledger
            .claim_due_retries(now, Duration::minutes(5), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        // Leased: not due again until the lease runs out
        let again = ledger
            .claim_due_retries(now, Duration::minutes(5), 10)
            .await
            .unwrap();
        assert!(again.is_empty());
        let later = ledger
            .claim_due_retries(now + Duration::minutes(6), Duration::minutes(5), 10)
            .await
            .unwrap();
        assert_eq!(later.len(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_and_exhausted_marks() {
        let (ledger, request_id) = seeded().await;
        let now = Utc::now();
        let attempt = DeliveryAttempt::pending(request_id, Channel::Sms, 1);
        ledger.record(&attempt).await.unwrap();

        let timed_out = ledger.mark_timed_out(attempt.id, now).await.unwrap();
        assert!(timed_out.timed_out);
        assert!(is_retryable(&timed_out));

        // Not a failure yet
        assert!(ledger.mark_exhausted(attempt.id).await.is_err());

        ledger
            .update_status(attempt.id, DeliveryStatus::Failed, StatusDetail::transient("timed out", None))
            .await
            .unwrap();
        let exhausted = ledger.mark_exhausted(attempt.id).await.unwrap();
        assert!(exhausted.is_retries_exhausted());
        assert!(!is_retryable(&exhausted));
    }

    #[tokio::test]
    async fn test_engagements_and_external_lookup() {
        let (ledger, request_id) = seeded().await;
        let attempt = DeliveryAttempt::pending(request_id, Channel::Mail, 1);
        ledger.record(&attempt).await.unwrap();
        ledger
            .update_status(attempt.id, DeliveryStatus::Sent, StatusDetail::sent("em_9"))
            .await
            .unwrap();

        let found = ledger.find_by_external_id("em_9").await.unwrap().unwrap();
        assert_eq!(found.id, attempt.id);
        assert!(ledger.find_by_external_id("em_0").await.unwrap().is_none());

        let event = EngagementEvent {
            id: Uuid::new_v4(),
            attempt_id: attempt.id,
            kind: herald_common::types::EngagementKind::Opened,
            occurred_at: Utc::now(),
        };
        ledger.record_engagement(&event).await.unwrap();
        assert_eq!(ledger.list_engagements(request_id).await.unwrap(), vec![event]);
    }

    #[tokio::test]
    async fn test_mark_cancelled() {
        let (ledger, request_id) = seeded().await;
        assert!(ledger.mark_cancelled(request_id).await.unwrap());
        assert!(ledger.get_request(request_id).await.unwrap().unwrap().cancelled);
        assert!(!ledger.mark_cancelled(Uuid::new_v4()).await.unwrap());
    }
}
