//! Scheduler: parks requests until their `due_at` and releases them back
//! into the dispatcher.
//!
//! Entries sit in a min-heap keyed by `(due_at, seq)`. Schedule, cancel and
//! poll all run under one mutex, and `poll_due` flips each entry's `fired`
//! flag inside that critical section, so an entry is released at most once
//! and a cancel that loses the race is a no-op. Replaced or cancelled entries
//! leave stale heap nodes behind; they are skipped when popped.
//!
//! An optional [`ScheduleStore`] mirrors entries so they survive restarts.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use herald_common::config::EngineConfig;
use herald_common::error::AppError;
use herald_common::types::ScheduledEntry;

use crate::dispatch::Dispatcher;

/// Due entries re-dispatched concurrently per tick.
const RELEASE_CONCURRENCY: usize = 16;

/// How to find the entry to cancel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelTarget {
    RequestId(Uuid),
    IdempotencyKey(String),
}

/// A persisted entry plus whether it had already been released.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub entry: ScheduledEntry,
    pub fired: bool,
}

/// Durable mirror of the scheduler queue.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert or replace the entry for its request id, unfired.
    async fn save(&self, entry: &ScheduledEntry) -> Result<(), AppError>;
    async fn mark_fired(&self, request_id: Uuid) -> Result<(), AppError>;
    async fn remove(&self, request_id: Uuid) -> Result<(), AppError>;
    async fn load(&self) -> Result<Vec<StoredEntry>, AppError>;
}

struct Slot {
    entry: ScheduledEntry,
    seq: u64,
    fired: bool,
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64, Uuid)>>,
    slots: HashMap<Uuid, Slot>,
    by_key: HashMap<String, Uuid>,
    next_seq: u64,
}

impl Queue {
    fn insert(&mut self, entry: ScheduledEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse((entry.due_at, seq, entry.request_id)));
        self.by_key
            .insert(entry.idempotency_key.clone(), entry.request_id);
        self.slots.insert(
            entry.request_id,
            Slot {
                entry,
                seq,
                fired: false,
            },
        );
    }

    fn remove(&mut self, request_id: Uuid) -> Option<Slot> {
        let slot = self.slots.remove(&request_id)?;
        if self.by_key.get(&slot.entry.idempotency_key) == Some(&request_id) {
            self.by_key.remove(&slot.entry.idempotency_key);
        }
        Some(slot)
    }
}

pub struct Scheduler {
    queue: Mutex<Queue>,
    store: Option<Arc<dyn ScheduleStore>>,
    poll_interval: Duration,
    requeue_delay: chrono::Duration,
}

impl Scheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            store: None,
            poll_interval: config.scheduler_poll_interval(),
            requeue_delay: config.scheduler_requeue_delay(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ScheduleStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of entries that have not fired yet.
    pub fn pending_len(&self) -> usize {
        self.queue().slots.values().filter(|s| !s.fired).count()
    }

    /// The unfired entry for a request, if any.
    pub fn get(&self, request_id: Uuid) -> Option<ScheduledEntry> {
        self.queue()
            .slots
            .get(&request_id)
            .filter(|s| !s.fired)
            .map(|s| s.entry.clone())
    }

    /// Park an entry. Replaces any previous entry for the same request.
    pub async fn schedule(&self, entry: ScheduledEntry) -> Result<(), AppError> {
        if let Some(store) = &self.store {
            store.save(&entry).await?;
        }

        tracing::info!(
            request_id = %entry.request_id,
            due_at = %entry.due_at,
            reason = %entry.reason,
            channels = ?entry.channels,
            "Notification scheduled"
        );
        self.queue().insert(entry);
        Ok(())
    }

    /// Remove a not-yet-fired entry. Returns it, or `None` if there was
    /// nothing to cancel (unknown, or already released).
    pub async fn cancel(&self, target: &CancelTarget) -> Result<Option<ScheduledEntry>, AppError> {
        let removed = {
            let mut queue = self.queue();
            let request_id = match target {
                CancelTarget::RequestId(id) => Some(*id),
                CancelTarget::IdempotencyKey(key) => queue.by_key.get(key).copied(),
            };

            let found = request_id.and_then(|id| queue.slots.get(&id).map(|s| (id, s.fired)));
            match found {
                Some((id, false)) => queue.remove(id).map(|slot| slot.entry),
                Some((id, true)) => {
                    tracing::debug!(request_id = %id, "Cancel ignored: entry already fired");
                    None
                }
                None => None,
            }
        };

        if let Some(entry) = &removed {
            tracing::info!(request_id = %entry.request_id, "Scheduled notification cancelled");
            if let Some(store) = &self.store {
                store.remove(entry.request_id).await?;
            }
        }
        Ok(removed)
    }

    /// Release every entry with `due_at <= now`, marking each fired.
    pub async fn poll_due(&self, now: DateTime<Utc>) -> Vec<ScheduledEntry> {
        let due = {
            let mut queue = self.queue();
            let mut due = Vec::new();

            while let Some(Reverse((due_at, seq, request_id))) = queue.heap.peek().copied() {
                if due_at > now {
                    break;
                }
                queue.heap.pop();

                if let Some(slot) = queue.slots.get_mut(&request_id)
                    && slot.seq == seq
                    && !slot.fired
                {
                    slot.fired = true;
                    due.push(slot.entry.clone());
                }
            }
            due
        };

        if let Some(store) = &self.store {
            for entry in &due {
                if let Err(e) = store.mark_fired(entry.request_id).await {
                    tracing::warn!(
                        request_id = %entry.request_id,
                        error = %e,
                        "Failed to persist fired flag"
                    );
                }
            }
        }
        due
    }

    /// Forget a released entry after a successful re-dispatch. An entry
    /// re-scheduled during that dispatch is kept.
    pub async fn complete(&self, request_id: Uuid) -> Result<(), AppError> {
        let removed = {
            let mut queue = self.queue();
            let fired = queue.slots.get(&request_id).is_some_and(|slot| slot.fired);
            fired && queue.remove(request_id).is_some()
        };

        if removed && let Some(store) = &self.store {
            store.remove(request_id).await?;
        }
        Ok(())
    }

    /// Re-dispatch failed: re-queue once after the requeue delay, then give up loudly.
    pub async fn handle_failure(
        &self,
        mut entry: ScheduledEntry,
        error: &AppError,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        if entry.requeue_count == 0 {
            entry.requeue_count += 1;
            entry.due_at = now + self.requeue_delay;
            tracing::warn!(
                request_id = %entry.request_id,
                error = %error,
                due_at = %entry.due_at,
                "Scheduled dispatch failed, re-queued"
            );
            return self.schedule(entry).await;
        }

        tracing::error!(
            request_id = %entry.request_id,
            idempotency_key = %entry.idempotency_key,
            reason = %entry.reason,
            error = %error,
            "Scheduled notification permanently failed"
        );
        self.complete(entry.request_id).await
    }

    /// Load persisted entries. Entries stored as fired but never completed
    /// are misfires: they are logged and re-queued as freshly submitted.
    pub async fn restore(&self) -> Result<usize, AppError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let stored = store.load().await?;
        let count = stored.len();

        for StoredEntry { entry, fired } in stored {
            if fired {
                tracing::warn!(
                    request_id = %entry.request_id,
                    due_at = %entry.due_at,
                    "Scheduler misfire: entry fired but never completed, re-queueing"
                );
                store.save(&entry).await?;
            }
            self.queue().insert(entry);
        }

        tracing::info!(count, "Scheduled notifications restored");
        Ok(count)
    }

    /// Release due entries into the dispatcher. Returns how many were released.
    pub async fn tick(&self, dispatcher: &Dispatcher, now: DateTime<Utc>) -> usize {
        let due = self.poll_due(now).await;
        let released = due.len();

        futures::stream::iter(due)
            .for_each_concurrent(RELEASE_CONCURRENCY, |entry| async move {
                let request_id = entry.request_id;
                let outcome = match dispatcher.resume(&entry, now).await {
                    Ok(result) => {
                        tracing::info!(
                            request_id = %request_id,
                            outcomes = ?result.outcomes,
                            "Scheduled notification released"
                        );
                        self.complete(request_id).await
                    }
                    Err(e) => self.handle_failure(entry, &e, now).await,
                };
                if let Err(e) = outcome {
                    tracing::error!(request_id = %request_id, error = %e, "Scheduler bookkeeping failed");
                }
            })
            .await;

        released
    }

    /// Tick on the configured interval forever.
    pub async fn run(self: Arc<Self>, dispatcher: Arc<Dispatcher>) {
        tracing::info!(poll_interval = ?self.poll_interval, "Scheduler started");

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let released = self.tick(&dispatcher, Utc::now()).await;
            if released > 0 {
                tracing::debug!(released, "Scheduler tick");
            }
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ScheduleRow {
    entry: Json<ScheduledEntry>,
    fired: bool,
}

/// `scheduled_notifications` table.
#[derive(Clone)]
pub struct PgScheduleStore {
    pool: PgPool,
}

impl PgScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    async fn save(&self, entry: &ScheduledEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_notifications (request_id, idempotency_key, due_at, reason, entry, fired)
            VALUES ($1, $2, $3, $4, $5, FALSE)
            ON CONFLICT (request_id) DO UPDATE SET
                idempotency_key = EXCLUDED.idempotency_key,
                due_at = EXCLUDED.due_at,
                reason = EXCLUDED.reason,
                entry = EXCLUDED.entry,
                fired = FALSE
            "#,
        )
        .bind(entry.request_id)
        .bind(&entry.idempotency_key)
        .bind(entry.due_at)
        .bind(entry.reason)
        .bind(Json(entry))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_fired(&self, request_id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE scheduled_notifications SET fired = TRUE WHERE request_id = $1")
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove(&self, request_id: Uuid) -> Result<(), AppError> {
        sqlx::query("DELETE FROM scheduled_notifications WHERE request_id = $1")
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load(&self) -> Result<Vec<StoredEntry>, AppError> {
        let rows: Vec<ScheduleRow> =
            sqlx::query_as("SELECT entry, fired FROM scheduled_notifications ORDER BY due_at")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|row| StoredEntry {
                entry: row.entry.0,
                fired: row.fired,
            })
            .collect())
    }
}
