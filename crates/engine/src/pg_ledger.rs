//! PostgreSQL-backed delivery ledger.
//!
//! Status updates lock the attempt row (`SELECT ... FOR UPDATE`) inside a
//! transaction, so concurrent writers to one attempt are serialized by the
//! database. The single-pending rule is also backed by a partial unique index.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    DeliveryAttempt, DeliveryStatus, DispatchResult, EngagementEvent, FailureKind,
    NotificationRequest, RequestRecord, StatusDetail,
};

use crate::ledger::{DeliveryLedger, apply_status};

#[derive(Debug, sqlx::FromRow)]
struct RequestRow {
    idempotency_key: String,
    request: Json<NotificationRequest>,
    result: Json<DispatchResult>,
    cancelled: bool,
    created_at: DateTime<Utc>,
}

impl From<RequestRow> for RequestRecord {
    fn from(row: RequestRow) -> Self {
        RequestRecord {
            request: row.request.0,
            idempotency_key: row.idempotency_key,
            result: row.result.0,
            cancelled: row.cancelled,
            created_at: row.created_at,
        }
    }
}

/// Map unique-index violations to `Conflict`; everything else stays a database error.
fn conflict_on_unique(err: sqlx::Error, what: impl FnOnce() -> String) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => AppError::Conflict(what()),
        _ => AppError::Database(err),
    }
}

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryLedger for PgLedger {
    async fn record_request(&self, record: &RequestRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO notification_requests
                (id, idempotency_key, notification_type, recipient_ref, request, result, cancelled, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.request.id)
        .bind(&record.idempotency_key)
        .bind(record.request.notification_type)
        .bind(&record.request.recipient_ref)
        .bind(Json(&record.request))
        .bind(Json(&record.result))
        .bind(record.cancelled)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, || format!("Request {} already recorded", record.request.id)))?;

        Ok(())
    }

    async fn update_request_result(
        &self,
        request_id: Uuid,
        result: &DispatchResult,
    ) -> Result<(), AppError> {
        let updated = sqlx::query("UPDATE notification_requests SET result = $2 WHERE id = $1")
            .bind(request_id)
            .bind(Json(result))
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Request {} not found", request_id)));
        }
        Ok(())
    }

    async fn get_request(&self, request_id: Uuid) -> Result<Option<RequestRecord>, AppError> {
        let row: Option<RequestRow> = sqlx::query_as(
            r#"
            SELECT idempotency_key, request, result, cancelled, created_at
            FROM notification_requests
            WHERE id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(RequestRecord::from))
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
        within: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<RequestRecord>, AppError> {
        let row: Option<RequestRow> = sqlx::query_as(
            r#"
            SELECT idempotency_key, request, result, cancelled, created_at
            FROM notification_requests
            WHERE idempotency_key = $1 AND created_at >= $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(key)
        .bind(now - within)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(RequestRecord::from))
    }

    async fn mark_cancelled(&self, request_id: Uuid) -> Result<bool, AppError> {
        let updated = sqlx::query("UPDATE notification_requests SET cancelled = TRUE WHERE id = $1")
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn record(&self, attempt: &DeliveryAttempt) -> Result<(), AppError> {
        let highest: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT MAX(attempt_number) FROM delivery_attempts
            WHERE request_id = $1 AND channel = $2
            "#,
        )
        .bind(attempt.request_id)
        .bind(attempt.channel)
        .fetch_one(&self.pool)
        .await?;

        if let Some(highest) = highest
            && attempt.attempt_number <= highest
        {
            return Err(AppError::Conflict(format!(
                "Attempt number {} on {} is not above {}",
                attempt.attempt_number, attempt.channel, highest
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO delivery_attempts
                (id, request_id, channel, attempt_number, status, failure_kind,
                 external_delivery_id, error_reason, timed_out, next_retry_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.request_id)
        .bind(attempt.channel)
        .bind(attempt.attempt_number)
        .bind(attempt.status)
        .bind(attempt.failure_kind)
        .bind(&attempt.external_delivery_id)
        .bind(&attempt.error_reason)
        .bind(attempt.timed_out)
        .bind(attempt.next_retry_at)
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!(
                    "Attempt {} on {} conflicts with an existing or pending attempt",
                    attempt.attempt_number, attempt.channel
                )
            })
        })?;

        Ok(())
    }

    async fn update_status(
        &self,
        attempt_id: Uuid,
        status: DeliveryStatus,
        detail: StatusDetail,
    ) -> Result<DeliveryAttempt, AppError> {
        let mut tx = self.pool.begin().await?;

        let mut attempt: DeliveryAttempt =
            sqlx::query_as("SELECT * FROM delivery_attempts WHERE id = $1 FOR UPDATE")
                .bind(attempt_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("Delivery attempt {} not found", attempt_id))
                })?;

        apply_status(&mut attempt, status, detail, Utc::now())?;

        sqlx::query(
            r#"
            UPDATE delivery_attempts
            SET status = $2, failure_kind = $3, external_delivery_id = $4,
                error_reason = $5, next_retry_at = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.status)
        .bind(attempt.failure_kind)
        .bind(&attempt.external_delivery_id)
        .bind(&attempt.error_reason)
        .bind(attempt.next_retry_at)
        .bind(attempt.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(attempt)
    }

    async fn mark_timed_out(
        &self,
        attempt_id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Result<DeliveryAttempt, AppError> {
        sqlx::query_as(
            r#"
            UPDATE delivery_attempts
            SET timed_out = TRUE, next_retry_at = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(attempt_id)
        .bind(next_retry_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::Conflict(format!("Attempt {} is not pending", attempt_id)))
    }

    async fn mark_exhausted(&self, attempt_id: Uuid) -> Result<DeliveryAttempt, AppError> {
        sqlx::query_as(
            r#"
            UPDATE delivery_attempts
            SET failure_kind = $2, error_reason = $3, next_retry_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'failed' AND failure_kind = 'transient'
            RETURNING *
            "#,
        )
        .bind(attempt_id)
        .bind(FailureKind::Permanent)
        .bind(DeliveryAttempt::RETRIES_EXHAUSTED)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            AppError::Conflict(format!("Attempt {} is not a transient failure", attempt_id))
        })
    }

    async fn set_next_retry(
        &self,
        attempt_id: Uuid,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE delivery_attempts SET next_retry_at = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(attempt_id)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>, AppError> {
        // RETURNING yields post-update rows; the lease timestamp is not
        // interesting to the caller, so report the original due time instead.
        let mut claimed: Vec<DeliveryAttempt> = sqlx::query_as(
            r#"
            WITH due AS (
                SELECT id, next_retry_at AS due_at FROM delivery_attempts
                WHERE next_retry_at <= $1
                  AND ((status = 'failed' AND failure_kind = 'transient')
                       OR (status = 'pending' AND timed_out))
                ORDER BY next_retry_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE delivery_attempts a
            SET next_retry_at = $2
            FROM due
            WHERE a.id = due.id
            RETURNING a.id, a.request_id, a.channel, a.attempt_number, a.status, a.failure_kind,
                      a.external_delivery_id, a.error_reason, a.timed_out,
                      due.due_at AS next_retry_at, a.created_at, a.updated_at
            "#,
        )
        .bind(now)
        .bind(now + lease)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        claimed.sort_by_key(|a| a.next_retry_at);
        Ok(claimed)
    }

    async fn get_attempt(&self, attempt_id: Uuid) -> Result<Option<DeliveryAttempt>, AppError> {
        let attempt = sqlx::query_as("SELECT * FROM delivery_attempts WHERE id = $1")
            .bind(attempt_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(attempt)
    }

    async fn list_attempts(&self, request_id: Uuid) -> Result<Vec<DeliveryAttempt>, AppError> {
        let mut attempts: Vec<DeliveryAttempt> = sqlx::query_as(
            r#"
            SELECT * FROM delivery_attempts
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;

        // Enum order, not the text order of channel names
        attempts.sort_by_key(|a| (a.channel, a.attempt_number));
        Ok(attempts)
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<DeliveryAttempt>, AppError> {
        let attempt = sqlx::query_as(
            r#"
            SELECT * FROM delivery_attempts
            WHERE external_delivery_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(attempt)
    }

    async fn record_engagement(&self, event: &EngagementEvent) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_engagements (id, attempt_id, kind, occurred_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event.id)
        .bind(event.attempt_id)
        .bind(event.kind)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_engagements(&self, request_id: Uuid) -> Result<Vec<EngagementEvent>, AppError> {
        let events = sqlx::query_as(
            r#"
            SELECT e.id, e.attempt_id, e.kind, e.occurred_at
            FROM delivery_engagements e
            JOIN delivery_attempts a ON a.id = e.attempt_id
            WHERE a.request_id = $1
            ORDER BY e.occurred_at
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}
