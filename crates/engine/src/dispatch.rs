//! Dispatch core.
//!
//! For one request:
//! 1. Validate the type's template fields and the quiet-hours override
//! 2. Dedup on the idempotency key inside the dedup window
//! 3. Resolve preferences and intersect with requested and registered channels
//! 4. Park the request if `send_at` is in the future
//! 5. Split channels by quiet hours; deferred ones go to the scheduler
//! 6. Fan out to the remaining channels concurrently, recording an attempt
//!    per channel before its send and its classified result after
//!
//! The scheduler re-enters at step 3 through [`Dispatcher::resume`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use uuid::Uuid;

use herald_common::config::EngineConfig;
use herald_common::error::AppError;
use herald_common::types::{
    Channel, ChannelOutcome, DeliveryAttempt, DeliveryStatus, DispatchResult, EngagementEvent,
    FailureKind, NotificationRequest, NotificationType, RequestRecord, ScheduleReason,
    ScheduledEntry, StatusDetail,
};

use crate::delivery::Delivery;
use crate::ledger::DeliveryLedger;
use crate::preferences::{PreferenceResolver, RecipientPreference};
use crate::scheduler::{CancelTarget, Scheduler};
use crate::templates::TemplateBuilder;

/// What a dispatch call returns to the submitter.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReceipt {
    pub result: DispatchResult,
    /// The key matched an earlier request; `result` is that request's result.
    pub duplicate: bool,
}

/// Everything known about one request, for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct RequestStatus {
    pub record: RequestRecord,
    pub scheduled: Option<ScheduledEntry>,
    pub attempts: Vec<DeliveryAttempt>,
    pub engagements: Vec<EngagementEvent>,
}

/// Caller-facing outcome implied by the latest attempt on a channel.
pub fn outcome_of(attempt: &DeliveryAttempt) -> ChannelOutcome {
    let reason = || attempt.error_reason.clone().unwrap_or_default();
    match attempt.status {
        DeliveryStatus::Sent | DeliveryStatus::Delivered => ChannelOutcome::Sent {
            external_id: attempt.external_delivery_id.clone().unwrap_or_default(),
        },
        DeliveryStatus::Pending => ChannelOutcome::Queued {
            reason: if attempt.timed_out { "timeout".to_string() } else { "in flight".to_string() },
        },
        DeliveryStatus::Failed if attempt.failure_kind == Some(FailureKind::Transient) => {
            ChannelOutcome::Queued { reason: reason() }
        }
        DeliveryStatus::Failed => ChannelOutcome::Failed { reason: reason() },
        DeliveryStatus::Bounced => ChannelOutcome::Failed {
            reason: "bounced".to_string(),
        },
        DeliveryStatus::Suppressed => ChannelOutcome::Failed {
            reason: "suppressed".to_string(),
        },
    }
}

/// Per-key async locks so two submissions with one idempotency key cannot
/// both pass the dedup check. Entries are dropped once nobody holds them.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    /// Wait for the lock on `key`. Released when the guard drops, including
    /// when the waiting or holding future is itself dropped.
    async fn lock<'a>(&'a self, key: &str) -> KeyGuard<'a> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone();
        let mut guard = KeyGuard {
            locks: self,
            key: key.to_string(),
            lock: Some(lock.clone()),
            held: None,
        };
        guard.held = Some(lock.lock_owned().await);
        guard
    }
}

struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    lock: Option<Arc<tokio::sync::Mutex<()>>>,
    held: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.held.take();
        self.lock.take();
        let mut locks = self.locks.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = locks.get(&self.key)
            && Arc::strong_count(entry) == 1
        {
            locks.remove(&self.key);
        }
    }
}

pub struct Dispatcher {
    delivery: Arc<Delivery>,
    resolver: Arc<dyn PreferenceResolver>,
    scheduler: Arc<Scheduler>,
    templates: TemplateBuilder,
    config: EngineConfig,
    key_locks: KeyLocks,
}

impl Dispatcher {
    pub fn new(
        delivery: Arc<Delivery>,
        resolver: Arc<dyn PreferenceResolver>,
        scheduler: Arc<Scheduler>,
        config: EngineConfig,
    ) -> Self {
        Self {
            delivery,
            resolver,
            scheduler,
            templates: TemplateBuilder::new(),
            config,
            key_locks: KeyLocks::default(),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn DeliveryLedger> {
        self.delivery.ledger()
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub async fn dispatch(&self, request: NotificationRequest) -> Result<DispatchReceipt, AppError> {
        self.dispatch_at(request, Utc::now()).await
    }

    /// Dispatch as of `now`. Caller errors (`InvalidPayload`,
    /// `NoEligibleChannel`) are returned before any attempt exists; channel
    /// failures are reported per channel in the result, never as `Err`.
    pub async fn dispatch_at(
        &self,
        request: NotificationRequest,
        now: DateTime<Utc>,
    ) -> Result<DispatchReceipt, AppError> {
        self.validate(&request)?;

        let key = request.effective_idempotency_key();
        let _guard = self.key_locks.lock(&key).await;
        self.dispatch_locked(request, &key, now).await
    }

    fn validate(&self, request: &NotificationRequest) -> Result<(), AppError> {
        if request.override_quiet_hours && request.notification_type != NotificationType::Emergency {
            return Err(AppError::InvalidPayload(format!(
                "override_quiet_hours is reserved for {}, not {}",
                NotificationType::Emergency,
                request.notification_type
            )));
        }
        self.templates
            .validate(request.notification_type, &request.data)
    }

    async fn dispatch_locked(
        &self,
        request: NotificationRequest,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchReceipt, AppError> {
        let ledger = self.ledger();

        if let Some(prior) = ledger
            .find_by_idempotency_key(key, self.config.dedup_window(), now)
            .await?
            && !prior.cancelled
            && prior.result.suppresses_duplicates()
        {
            tracing::debug!(
                request_id = %prior.request.id,
                idempotency_key = %key,
                "Duplicate submission suppressed"
            );
            return Ok(DispatchReceipt {
                result: prior.result,
                duplicate: true,
            });
        }

        let preference = self.resolve(&request.recipient_ref).await?;
        let channels = self.eligible_channels(&request, &preference);
        if channels.is_empty() {
            tracing::debug!(
                recipient_ref = %request.recipient_ref,
                notification_type = %request.notification_type,
                "No eligible channel"
            );
            return Err(AppError::NoEligibleChannel(request.recipient_ref));
        }

        ledger
            .record_request(&RequestRecord {
                request: request.clone(),
                idempotency_key: key.to_string(),
                result: DispatchResult::new(request.id),
                cancelled: false,
                created_at: now,
            })
            .await?;

        let outcomes = self
            .route(&request, key, &preference, channels, now, true)
            .await?;
        let result = DispatchResult {
            request_id: request.id,
            outcomes,
        };
        ledger.update_request_result(request.id, &result).await?;

        tracing::info!(
            request_id = %request.id,
            notification_type = %request.notification_type,
            recipient_ref = %request.recipient_ref,
            priority = ?request.priority,
            outcomes = ?result.outcomes,
            "Notification dispatched"
        );

        Ok(DispatchReceipt {
            result,
            duplicate: false,
        })
    }

    /// Re-enter dispatch for a released scheduler entry: preferences and
    /// quiet hours are evaluated again as of `now`.
    pub async fn resume(
        &self,
        entry: &ScheduledEntry,
        now: DateTime<Utc>,
    ) -> Result<DispatchResult, AppError> {
        let ledger = self.ledger();
        let request = &entry.request;

        let record = match ledger.get_request(entry.request_id).await? {
            Some(record) => record,
            None => {
                let record = RequestRecord {
                    request: request.clone(),
                    idempotency_key: entry.idempotency_key.clone(),
                    result: DispatchResult::new(entry.request_id),
                    cancelled: false,
                    created_at: now,
                };
                ledger.record_request(&record).await?;
                record
            }
        };

        if record.cancelled {
            tracing::info!(request_id = %entry.request_id, "Release skipped: request cancelled");
            return Ok(record.result);
        }

        let preference = self.resolve(&request.recipient_ref).await?;
        let eligible = self.eligible_channels(request, &preference);
        let channels: BTreeSet<Channel> = entry.channels.intersection(&eligible).copied().collect();

        let mut result = record.result;
        for channel in entry.channels.difference(&channels) {
            tracing::info!(
                request_id = %entry.request_id,
                channel = %channel,
                "Channel no longer eligible at release"
            );
            result.outcomes.insert(
                *channel,
                ChannelOutcome::Failed {
                    reason: "channel no longer eligible".to_string(),
                },
            );
        }

        let outcomes = self
            .route(request, &entry.idempotency_key, &preference, channels, now, false)
            .await?;
        result.outcomes.extend(outcomes);
        ledger.update_request_result(entry.request_id, &result).await?;

        Ok(result)
    }

    /// Cancel by request id or idempotency key.
    ///
    /// Returns `true` when a not-yet-fired scheduled entry was removed, i.e.
    /// a dispatch was prevented. In every case the request is flagged
    /// cancelled, which stops further retries and suppresses attempts left
    /// pending by a request timeout.
    pub async fn cancel(&self, target: CancelTarget, now: DateTime<Utc>) -> Result<bool, AppError> {
        let ledger = self.ledger();
        let removed = self.scheduler.cancel(&target).await?;

        let request_id = match (&removed, &target) {
            (Some(entry), _) => Some(entry.request_id),
            (None, CancelTarget::RequestId(id)) => Some(*id),
            (None, CancelTarget::IdempotencyKey(key)) => ledger
                .find_by_idempotency_key(key, self.config.dedup_window(), now)
                .await?
                .map(|record| record.request.id),
        };

        let Some(request_id) = request_id else {
            return Err(AppError::NotFound(format!("No notification matches {:?}", target)));
        };

        if !ledger.mark_cancelled(request_id).await? && removed.is_none() {
            return Err(AppError::NotFound(format!("Request {} not found", request_id)));
        }

        for attempt in ledger.list_attempts(request_id).await? {
            if attempt.status == DeliveryStatus::Pending && attempt.timed_out {
                match ledger
                    .update_status(
                        attempt.id,
                        DeliveryStatus::Suppressed,
                        StatusDetail::note("request cancelled"),
                    )
                    .await
                {
                    Ok(_) | Err(AppError::InvalidTransition { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        tracing::info!(
            request_id = %request_id,
            prevented = removed.is_some(),
            "Notification cancelled"
        );
        Ok(removed.is_some())
    }

    pub async fn status(&self, request_id: Uuid) -> Result<RequestStatus, AppError> {
        let ledger = self.ledger();
        let record = ledger
            .get_request(request_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Request {} not found", request_id)))?;

        Ok(RequestStatus {
            record,
            scheduled: self.scheduler.get(request_id),
            attempts: ledger.list_attempts(request_id).await?,
            engagements: ledger.list_engagements(request_id).await?,
        })
    }

    /// Unknown recipients resolve to an empty preference (nothing enabled).
    async fn resolve(&self, recipient_ref: &str) -> Result<RecipientPreference, AppError> {
        match self.resolver.resolve(recipient_ref).await {
            Err(AppError::NotFound(_)) => Ok(RecipientPreference::new(recipient_ref)),
            other => other,
        }
    }

    fn eligible_channels(
        &self,
        request: &NotificationRequest,
        preference: &RecipientPreference,
    ) -> BTreeSet<Channel> {
        let registry = self.delivery.registry();
        preference
            .eligible_channels(request)
            .into_iter()
            .filter(|channel| {
                let registered = registry.contains(*channel);
                if !registered {
                    tracing::warn!(
                        channel = %channel,
                        recipient_ref = %request.recipient_ref,
                        "Channel enabled but no provider registered"
                    );
                }
                registered
            })
            .collect()
    }

    /// Steps 4-6 for an already-resolved channel set.
    async fn route(
        &self,
        request: &NotificationRequest,
        key: &str,
        preference: &RecipientPreference,
        channels: BTreeSet<Channel>,
        now: DateTime<Utc>,
        honor_send_at: bool,
    ) -> Result<BTreeMap<Channel, ChannelOutcome>, AppError> {
        if honor_send_at
            && let Some(send_at) = request.send_at
            && send_at > now
        {
            let outcomes = channels
                .iter()
                .map(|c| (*c, ChannelOutcome::Deferred { due_at: send_at }))
                .collect();
            self.park(request, key, channels, send_at, ScheduleReason::ExplicitDelay)
                .await?;
            return Ok(outcomes);
        }

        let exempt = &self.config.quiet_hours_exempt_channels;
        let mut immediate = BTreeSet::new();
        let mut deferred = BTreeSet::new();
        let mut deferred_until = None;

        for channel in channels {
            match preference.quiet_hours_deferral(request, channel, exempt, now) {
                Some(until) => {
                    deferred.insert(channel);
                    deferred_until = Some(until);
                }
                None => {
                    immediate.insert(channel);
                }
            }
        }

        let mut outcomes = BTreeMap::new();
        if let Some(due_at) = deferred_until {
            outcomes.extend(
                deferred
                    .iter()
                    .map(|c| (*c, ChannelOutcome::Deferred { due_at })),
            );
            self.park(request, key, deferred, due_at, ScheduleReason::QuietHoursDeferral)
                .await?;
        }

        outcomes.extend(self.fan_out(request, preference, immediate, now).await?);
        Ok(outcomes)
    }

    async fn park(
        &self,
        request: &NotificationRequest,
        key: &str,
        channels: BTreeSet<Channel>,
        due_at: DateTime<Utc>,
        reason: ScheduleReason,
    ) -> Result<(), AppError> {
        self.scheduler
            .schedule(ScheduledEntry {
                request_id: request.id,
                idempotency_key: key.to_string(),
                channels,
                due_at,
                reason,
                request: request.clone(),
                requeue_count: 0,
            })
            .await
    }

    /// Send on every channel at once and wait for all of them, up to the
    /// request timeout. Each send runs on its own task, so it settles its
    /// attempt even if this call is dropped. Sends still running at the
    /// deadline are aborted and their attempts left pending for the retry
    /// supervisor.
    async fn fan_out(
        &self,
        request: &NotificationRequest,
        preference: &RecipientPreference,
        channels: BTreeSet<Channel>,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<Channel, ChannelOutcome>, AppError> {
        let mut outcomes = BTreeMap::new();
        if channels.is_empty() {
            return Ok(outcomes);
        }

        let ledger = self.ledger();
        let existing = ledger.list_attempts(request.id).await?;

        // A channel that already has attempts (re-dispatch after a misfire)
        // belongs to the retry supervisor; report its latest state instead.
        let mut attempts = Vec::new();
        for channel in channels {
            let latest = existing
                .iter()
                .filter(|a| a.channel == channel)
                .max_by_key(|a| a.attempt_number);
            if let Some(latest) = latest {
                outcomes.insert(channel, outcome_of(latest));
                continue;
            }

            let attempt = DeliveryAttempt::pending(request.id, channel, 1);
            ledger.record(&attempt).await?;
            attempts.push(attempt);
        }

        let deadline = tokio::time::Instant::now() + self.config.request_timeout();
        let mut aborts = Vec::with_capacity(attempts.len());
        let mut inflight: FuturesUnordered<_> = attempts
            .iter()
            .map(|attempt| {
                let address = preference.address(attempt.channel).unwrap_or_default();
                let handle = tokio::spawn(send_and_settle(
                    self.delivery.clone(),
                    attempt.clone(),
                    request.clone(),
                    address.to_string(),
                    now,
                ));
                aborts.push(handle.abort_handle());
                let channel = attempt.channel;
                async move { (channel, handle.await) }
            })
            .collect();

        loop {
            match tokio::time::timeout_at(deadline, inflight.next()).await {
                Ok(Some((channel, Ok(outcome)))) => {
                    outcomes.insert(channel, outcome);
                }
                Ok(Some((channel, Err(e)))) => {
                    tracing::error!(
                        request_id = %request.id,
                        channel = %channel,
                        error = %e,
                        "Send task failed"
                    );
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        request_id = %request.id,
                        timeout = ?self.config.request_timeout(),
                        remaining = inflight.len(),
                        "Request timeout reached, handing remaining channels to retry"
                    );
                    for abort in &aborts {
                        abort.abort();
                    }
                    break;
                }
            }
        }
        drop(inflight);

        let unsettled: Vec<&DeliveryAttempt> = attempts
            .iter()
            .filter(|a| !outcomes.contains_key(&a.channel))
            .collect();
        for attempt in unsettled {
            let next_retry_at = self
                .delivery
                .policy()
                .next_retry_at(attempt.attempt_number, now);
            let outcome = match ledger.mark_timed_out(attempt.id, next_retry_at).await {
                Ok(_) => ChannelOutcome::Queued {
                    reason: "timeout".to_string(),
                },
                // Settled just as its task was aborted
                Err(AppError::Conflict(_)) => match ledger.get_attempt(attempt.id).await? {
                    Some(current) => outcome_of(&current),
                    None => ChannelOutcome::Queued {
                        reason: "timeout".to_string(),
                    },
                },
                Err(e) => return Err(e),
            };
            outcomes.insert(attempt.channel, outcome);
        }

        Ok(outcomes)
    }
}

/// One channel's send plus the ledger write of its result.
async fn send_and_settle(
    delivery: Arc<Delivery>,
    attempt: DeliveryAttempt,
    request: NotificationRequest,
    address: String,
    now: DateTime<Utc>,
) -> ChannelOutcome {
    let result = delivery.send(&attempt, &request, &address).await;
    match delivery.settle(&attempt, &request, result, now).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(
                request_id = %request.id,
                channel = %attempt.channel,
                error = %e,
                "Failed to record delivery result"
            );
            ChannelOutcome::Failed {
                reason: format!("ledger write failed: {}", e),
            }
        }
    }
}
