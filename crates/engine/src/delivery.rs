//! Single-attempt delivery shared by the dispatcher and the retry supervisor:
//! render, send through the registry, then write the classified result.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use herald_common::error::AppError;
use herald_common::types::{
    ChannelOutcome, DeliveryAttempt, DeliveryStatus, NotificationRequest, StatusDetail,
};
use herald_notifier::{ChannelRegistry, ProviderError};

use crate::escalation::{Escalation, EscalationSink};
use crate::ledger::DeliveryLedger;
use crate::retry::RetryPolicy;
use crate::templates::TemplateBuilder;

pub struct Delivery {
    ledger: Arc<dyn DeliveryLedger>,
    registry: Arc<ChannelRegistry>,
    escalation: Arc<dyn EscalationSink>,
    templates: TemplateBuilder,
    policy: RetryPolicy,
    channel_timeout: Duration,
}

impl Delivery {
    pub fn new(
        ledger: Arc<dyn DeliveryLedger>,
        registry: Arc<ChannelRegistry>,
        escalation: Arc<dyn EscalationSink>,
        policy: RetryPolicy,
        channel_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            registry,
            escalation,
            templates: TemplateBuilder::new(),
            policy,
            channel_timeout,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn DeliveryLedger> {
        &self.ledger
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Render and send one already-recorded pending attempt. The attempt id
    /// is the correlation id handed to the provider.
    pub async fn send(
        &self,
        attempt: &DeliveryAttempt,
        request: &NotificationRequest,
        address: &str,
    ) -> Result<String, ProviderError> {
        let payload =
            self.templates
                .render(request.notification_type, &request.data, attempt.channel);
        self.registry
            .send(
                attempt.channel,
                address,
                &payload,
                attempt.id,
                self.channel_timeout,
            )
            .await
    }

    /// Write the provider result for `attempt` and translate it into the
    /// caller-facing outcome.
    ///
    /// Transient failures get a `next_retry_at` from the backoff policy, unless
    /// this was the final attempt, in which case the attempt is marked
    /// `retries_exhausted` and escalated.
    pub async fn settle(
        &self,
        attempt: &DeliveryAttempt,
        request: &NotificationRequest,
        result: Result<String, ProviderError>,
        now: DateTime<Utc>,
    ) -> Result<ChannelOutcome, AppError> {
        match result {
            Ok(external_id) => {
                self.ledger
                    .update_status(
                        attempt.id,
                        DeliveryStatus::Sent,
                        StatusDetail::sent(external_id.clone()),
                    )
                    .await?;
                tracing::info!(
                    request_id = %request.id,
                    channel = %attempt.channel,
                    attempt_number = attempt.attempt_number,
                    external_id = %external_id,
                    "Notification sent"
                );
                Ok(ChannelOutcome::Sent { external_id })
            }
            Err(ProviderError::Permanent(reason)) => {
                self.ledger
                    .update_status(
                        attempt.id,
                        DeliveryStatus::Failed,
                        StatusDetail::permanent(reason.clone()),
                    )
                    .await?;
                tracing::warn!(
                    request_id = %request.id,
                    channel = %attempt.channel,
                    attempt_number = attempt.attempt_number,
                    error = %reason,
                    "Delivery failed permanently"
                );
                Ok(ChannelOutcome::Failed { reason })
            }
            Err(ProviderError::Transient(reason)) => {
                if self.policy.is_final(attempt.attempt_number) {
                    self.exhaust(attempt, request, &reason, now).await?;
                    return Ok(ChannelOutcome::Failed {
                        reason: DeliveryAttempt::RETRIES_EXHAUSTED.to_string(),
                    });
                }

                let next_retry_at = self.policy.next_retry_at(attempt.attempt_number, now);
                self.ledger
                    .update_status(
                        attempt.id,
                        DeliveryStatus::Failed,
                        StatusDetail::transient(reason.clone(), Some(next_retry_at)),
                    )
                    .await?;
                tracing::warn!(
                    request_id = %request.id,
                    channel = %attempt.channel,
                    attempt_number = attempt.attempt_number,
                    error = %reason,
                    next_retry_at = %next_retry_at,
                    "Transient delivery failure, retry scheduled"
                );
                Ok(ChannelOutcome::Queued { reason })
            }
        }
    }

    /// Final transient failure: record `failed(permanent: retries_exhausted)`
    /// on a pending attempt and hand it to the escalation sink.
    pub async fn exhaust(
        &self,
        attempt: &DeliveryAttempt,
        request: &NotificationRequest,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.ledger
            .update_status(
                attempt.id,
                DeliveryStatus::Failed,
                StatusDetail::permanent(DeliveryAttempt::RETRIES_EXHAUSTED),
            )
            .await?;
        self.escalate(attempt, request, last_error, now).await;
        Ok(())
    }

    /// Report an exhausted attempt. Sink failures are logged, never propagated.
    pub async fn escalate(
        &self,
        attempt: &DeliveryAttempt,
        request: &NotificationRequest,
        last_error: &str,
        now: DateTime<Utc>,
    ) {
        let escalation = Escalation {
            request_id: request.id,
            attempt_id: attempt.id,
            channel: attempt.channel,
            attempt_number: attempt.attempt_number,
            notification_type: request.notification_type,
            recipient_ref: request.recipient_ref.clone(),
            last_error: last_error.to_string(),
            occurred_at: now,
        };

        if let Err(e) = self.escalation.escalate(&escalation).await {
            tracing::error!(
                request_id = %request.id,
                attempt_id = %attempt.id,
                error = %e,
                "Failed to escalate exhausted delivery"
            );
        }
    }
}
