//! Retry supervisor: background worker that re-attempts transient failures.
//!
//! Each `DeliveryAttempt` is a small state machine driven from the ledger:
//! `failed(transient)` with a due `next_retry_at` becomes a new pending
//! attempt numbered `n + 1`; after `max_attempts` the last attempt becomes
//! `failed(permanent: retries_exhausted)` and is escalated. Timed-out pending
//! attempts are failed as transient first, so only one attempt per channel is
//! ever pending.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;

use herald_common::config::EngineConfig;
use herald_common::error::AppError;
use herald_common::types::{
    Channel, ChannelOutcome, DeliveryAttempt, DeliveryStatus, StatusDetail,
};

use crate::delivery::Delivery;
use crate::preferences::PreferenceResolver;

/// How long a claimed retry stays invisible to other passes.
const CLAIM_LEASE_SECS: i64 = 300;

/// Exponential backoff: `base * 2^(n-1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay: chrono::Duration,
    pub max_delay: chrono::Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
        }
    }

    /// Delay before retrying after attempt `attempt_number` failed.
    pub fn delay(&self, attempt_number: i32) -> chrono::Duration {
        let exponent = (attempt_number - 1).clamp(0, 30) as u32;
        let seconds = self
            .base_delay
            .num_seconds()
            .saturating_mul(1i64 << exponent)
            .min(self.max_delay.num_seconds());
        chrono::Duration::seconds(seconds)
    }

    pub fn next_retry_at(&self, attempt_number: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.delay(attempt_number)
    }

    /// No retry follows this attempt.
    pub fn is_final(&self, attempt_number: i32) -> bool {
        attempt_number >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// What one retry pass did with one claimed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// A new attempt was sent; carries its outcome.
    Attempted(ChannelOutcome),
    Exhausted,
    /// Recipient quiet hours; `next_retry_at` moved to the window's end.
    Postponed(DateTime<Utc>),
    /// Request cancelled, recipient gone, or channel no longer eligible.
    Dropped,
}

/// Counters for one supervisor pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub attempted: usize,
    pub exhausted: usize,
    pub postponed: usize,
    pub dropped: usize,
    pub errors: usize,
}

impl RetrySummary {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct RetrySupervisor {
    delivery: Arc<Delivery>,
    resolver: Arc<dyn PreferenceResolver>,
    quiet_hours_exempt: BTreeSet<Channel>,
    workers: usize,
    poll_interval: Duration,
}

impl RetrySupervisor {
    pub fn new(
        delivery: Arc<Delivery>,
        resolver: Arc<dyn PreferenceResolver>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            delivery,
            resolver,
            quiet_hours_exempt: config.quiet_hours_exempt_channels.clone(),
            workers: config.retry_workers.max(1),
            poll_interval: config.retry_poll_interval(),
        }
    }

    /// Poll the ledger forever.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            poll_interval = ?self.poll_interval,
            workers = self.workers,
            "Retry supervisor started"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            match self.run_once(Utc::now()).await {
                Ok(summary) if !summary.is_empty() => {
                    tracing::info!(?summary, "Retry pass complete");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Retry pass failed"),
            }
        }
    }

    /// Claim and process every attempt due at `now`, `workers` at a time.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RetrySummary, AppError> {
        let due = self
            .delivery
            .ledger()
            .claim_due_retries(
                now,
                chrono::Duration::seconds(CLAIM_LEASE_SECS),
                self.workers * 16,
            )
            .await?;

        let results: Vec<Result<RetryOutcome, AppError>> = futures::stream::iter(due)
            .map(|attempt| self.process(attempt, now))
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut summary = RetrySummary::default();
        for result in results {
            match result {
                Ok(RetryOutcome::Attempted(_)) => summary.attempted += 1,
                Ok(RetryOutcome::Exhausted) => summary.exhausted += 1,
                Ok(RetryOutcome::Postponed(_)) => summary.postponed += 1,
                Ok(RetryOutcome::Dropped) => summary.dropped += 1,
                Err(e) => {
                    tracing::error!(error = %e, "Retry failed");
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn process(
        &self,
        attempt: DeliveryAttempt,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome, AppError> {
        let ledger = self.delivery.ledger();
        let policy = self.delivery.policy();

        let Some(record) = ledger.get_request(attempt.request_id).await? else {
            tracing::warn!(
                request_id = %attempt.request_id,
                attempt_id = %attempt.id,
                "Retry dropped: request not found"
            );
            ledger.set_next_retry(attempt.id, None).await?;
            return Ok(RetryOutcome::Dropped);
        };
        let request = &record.request;

        if record.cancelled {
            if attempt.status == DeliveryStatus::Pending {
                ledger
                    .update_status(
                        attempt.id,
                        DeliveryStatus::Suppressed,
                        StatusDetail::note("request cancelled"),
                    )
                    .await?;
            } else {
                ledger.set_next_retry(attempt.id, None).await?;
            }
            tracing::debug!(
                request_id = %request.id,
                channel = %attempt.channel,
                "Retry dropped: request cancelled"
            );
            return Ok(RetryOutcome::Dropped);
        }

        let failed = if attempt.status == DeliveryStatus::Pending {
            // Abandoned by the request-level timeout
            if policy.is_final(attempt.attempt_number) {
                self.delivery
                    .exhaust(&attempt, request, "timed out", now)
                    .await?;
                return Ok(RetryOutcome::Exhausted);
            }
            ledger
                .update_status(
                    attempt.id,
                    DeliveryStatus::Failed,
                    StatusDetail::transient("timed out", None),
                )
                .await?
        } else {
            if policy.is_final(attempt.attempt_number) {
                ledger.mark_exhausted(attempt.id).await?;
                let last_error = attempt.error_reason.as_deref().unwrap_or("unknown");
                self.delivery
                    .escalate(&attempt, request, last_error, now)
                    .await;
                return Ok(RetryOutcome::Exhausted);
            }
            attempt
        };

        let preference = match self.resolver.resolve(&request.recipient_ref).await {
            Ok(preference) => preference,
            Err(AppError::NotFound(_)) => {
                tracing::info!(
                    request_id = %request.id,
                    recipient_ref = %request.recipient_ref,
                    "Retry dropped: recipient no longer exists"
                );
                ledger.set_next_retry(failed.id, None).await?;
                return Ok(RetryOutcome::Dropped);
            }
            Err(e) => return Err(e),
        };

        let channel = failed.channel;
        let address = match preference.address(channel) {
            Some(address) if preference.eligible_channels(request).contains(&channel) => {
                address.to_string()
            }
            _ => {
                tracing::info!(
                    request_id = %request.id,
                    channel = %channel,
                    "Retry dropped: channel no longer eligible"
                );
                ledger.set_next_retry(failed.id, None).await?;
                return Ok(RetryOutcome::Dropped);
            }
        };

        if let Some(until) =
            preference.quiet_hours_deferral(request, channel, &self.quiet_hours_exempt, now)
        {
            ledger.set_next_retry(failed.id, Some(until)).await?;
            tracing::info!(
                request_id = %request.id,
                channel = %channel,
                until = %until,
                "Retry postponed until quiet hours end"
            );
            return Ok(RetryOutcome::Postponed(until));
        }

        let next = DeliveryAttempt::pending(request.id, channel, failed.attempt_number + 1);
        match ledger.record(&next).await {
            Ok(()) => {}
            Err(AppError::Conflict(reason)) => {
                tracing::debug!(
                    request_id = %request.id,
                    channel = %channel,
                    reason = %reason,
                    "Retry already taken over"
                );
                ledger.set_next_retry(failed.id, None).await?;
                return Ok(RetryOutcome::Dropped);
            }
            Err(e) => return Err(e),
        }
        ledger.set_next_retry(failed.id, None).await?;

        tracing::info!(
            request_id = %request.id,
            channel = %channel,
            attempt_number = next.attempt_number,
            "Retrying delivery"
        );

        let result = self.delivery.send(&next, request, &address).await;
        let outcome = self.delivery.settle(&next, request, result, now).await?;
        Ok(RetryOutcome::Attempted(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: chrono::Duration::seconds(60),
            max_delay: chrono::Duration::seconds(1800),
        }
    }

    #[test]
    fn test_backoff_doubles_from_base() {
        let p = policy();
        assert_eq!(p.delay(1).num_seconds(), 60);
        assert_eq!(p.delay(2).num_seconds(), 120);
        assert_eq!(p.delay(3).num_seconds(), 240);
        assert_eq!(p.delay(5).num_seconds(), 960);
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = policy();
        assert_eq!(p.delay(6).num_seconds(), 1800);
        assert_eq!(p.delay(40).num_seconds(), 1800);
    }

    #[test]
    fn test_oversized_config_does_not_overflow() {
        let config = EngineConfig {
            retry_base_delay_secs: u64::MAX,
            retry_max_delay_secs: u64::MAX,
            ..EngineConfig::default()
        };
        let p = RetryPolicy::from_config(&config);
        assert!(p.base_delay > chrono::Duration::zero());
        assert_eq!(p.delay(30), p.max_delay);
    }

    #[test]
    fn test_final_attempt() {
        let p = policy();
        assert!(!p.is_final(1));
        assert!(!p.is_final(2));
        assert!(p.is_final(3));
    }

    #[test]
    fn test_policy_from_default_config() {
        assert_eq!(RetryPolicy::default(), policy());
    }

    #[test]
    fn test_summary_is_empty() {
        assert!(RetrySummary::default().is_empty());
        let summary = RetrySummary {
            dropped: 1,
            ..Default::default()
        };
        assert!(!summary.is_empty());
    }
}
