use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Kinds of business events the engine knows how to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum NotificationType {
    LeadNew,
    LeadHot,
    LeadAssigned,
    AppointmentReminder,
    Escalation,
    Emergency,
}

impl NotificationType {
    pub const ALL: [NotificationType; 6] = [
        NotificationType::LeadNew,
        NotificationType::LeadHot,
        NotificationType::LeadAssigned,
        NotificationType::AppointmentReminder,
        NotificationType::Escalation,
        NotificationType::Emergency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::LeadNew => "lead_new",
            NotificationType::LeadHot => "lead_hot",
            NotificationType::LeadAssigned => "lead_assigned",
            NotificationType::AppointmentReminder => "appointment_reminder",
            NotificationType::Escalation => "escalation",
            NotificationType::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = Self::ALL.iter().map(|t| t.as_str()).collect();
                format!(
                    "Unknown notification type '{}'. Valid types: {}",
                    s,
                    valid.join(", ")
                )
            })
    }
}

/// Delivery medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Channel {
    Mail,
    Sms,
    Push,
    Realtime,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Mail, Channel::Sms, Channel::Push, Channel::Realtime];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Mail => "mail",
            Channel::Sms => "sms",
            Channel::Push => "push",
            Channel::Realtime => "realtime",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("Unknown channel '{}'", s))
    }
}

/// Request priority. High priority never bypasses quiet hours on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Status of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Bounced,
    Suppressed,
}

impl DeliveryStatus {
    /// Whether moving from `self` to `next` respects the status partial order.
    ///
    /// `pending -> {sent, failed, suppressed}`, `sent -> {delivered, bounced}`.
    /// Everything else, including same-status writes, is rejected.
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        matches!(
            (self, next),
            (DeliveryStatus::Pending, DeliveryStatus::Sent)
                | (DeliveryStatus::Pending, DeliveryStatus::Failed)
                | (DeliveryStatus::Pending, DeliveryStatus::Suppressed)
                | (DeliveryStatus::Sent, DeliveryStatus::Delivered)
                | (DeliveryStatus::Sent, DeliveryStatus::Bounced)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered
                | DeliveryStatus::Failed
                | DeliveryStatus::Bounced
                | DeliveryStatus::Suppressed
        )
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Bounced => write!(f, "bounced"),
            DeliveryStatus::Suppressed => write!(f, "suppressed"),
        }
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum FailureKind {
    Transient,
    Permanent,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Why a request (or part of one) was parked in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum ScheduleReason {
    ExplicitDelay,
    QuietHoursDeferral,
}

impl std::fmt::Display for ScheduleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleReason::ExplicitDelay => write!(f, "explicit_delay"),
            ScheduleReason::QuietHoursDeferral => write!(f, "quiet_hours_deferral"),
        }
    }
}

/// Inbound engagement events reported by providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum EngagementKind {
    Delivered,
    Opened,
    Clicked,
    Bounced,
}

impl EngagementKind {
    /// The status this event drives the attempt to, if any.
    pub fn target_status(self) -> Option<DeliveryStatus> {
        match self {
            EngagementKind::Delivered => Some(DeliveryStatus::Delivered),
            EngagementKind::Bounced => Some(DeliveryStatus::Bounced),
            EngagementKind::Opened | EngagementKind::Clicked => None,
        }
    }
}

impl std::fmt::Display for EngagementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngagementKind::Delivered => write!(f, "delivered"),
            EngagementKind::Opened => write!(f, "opened"),
            EngagementKind::Clicked => write!(f, "clicked"),
            EngagementKind::Bounced => write!(f, "bounced"),
        }
    }
}

/// The unit of work submitted to the engine.
///
/// `data` is a `BTreeMap` so iteration and serialization order are stable,
/// which keeps derived idempotency keys deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub recipient_ref: String,
    pub data: BTreeMap<String, serde_json::Value>,
    pub requested_channels: Option<BTreeSet<Channel>>,
    pub priority: Priority,
    pub send_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub override_quiet_hours: bool,
    pub created_at: DateTime<Utc>,
}

impl NotificationRequest {
    pub fn new(
        notification_type: NotificationType,
        recipient_ref: impl Into<String>,
        data: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_type,
            recipient_ref: recipient_ref.into(),
            data,
            requested_channels: None,
            priority: Priority::Normal,
            send_at: None,
            idempotency_key: None,
            override_quiet_hours: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_channels(mut self, channels: impl IntoIterator<Item = Channel>) -> Self {
        self.requested_channels = Some(channels.into_iter().collect());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_send_at(mut self, send_at: DateTime<Utc>) -> Self {
        self.send_at = Some(send_at);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_quiet_hours_override(mut self) -> Self {
        self.override_quiet_hours = true;
        self
    }

    /// The caller-supplied key, or `sha256(type|recipient|data)` in hex.
    pub fn effective_idempotency_key(&self) -> String {
        if let Some(key) = &self.idempotency_key {
            return key.clone();
        }

        let mut hasher = Sha256::new();
        hasher.update(self.notification_type.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.recipient_ref.as_bytes());
        hasher.update(b"|");
        hasher.update(serde_json::to_vec(&self.data).unwrap_or_default());
        hex::encode(hasher.finalize())
    }
}

/// One channel-specific try belonging to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub request_id: Uuid,
    pub channel: Channel,
    pub attempt_number: i32,
    pub status: DeliveryStatus,
    pub failure_kind: Option<FailureKind>,
    pub external_delivery_id: Option<String>,
    pub error_reason: Option<String>,
    /// Still `pending` because the request-level timeout fired before the send finished.
    pub timed_out: bool,
    /// When the retry supervisor should pick this attempt up.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    pub fn pending(request_id: Uuid, channel: Channel, attempt_number: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            request_id,
            channel,
            attempt_number,
            status: DeliveryStatus::Pending,
            failure_kind: None,
            external_delivery_id: None,
            error_reason: None,
            timed_out: false,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reason recorded when the retry budget runs out.
    pub const RETRIES_EXHAUSTED: &'static str = "retries_exhausted";

    pub fn is_retries_exhausted(&self) -> bool {
        self.status == DeliveryStatus::Failed
            && self.failure_kind == Some(FailureKind::Permanent)
            && self.error_reason.as_deref() == Some(Self::RETRIES_EXHAUSTED)
    }
}

/// Extra fields written alongside a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusDetail {
    pub external_id: Option<String>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl StatusDetail {
    pub fn sent(external_id: impl Into<String>) -> Self {
        Self {
            external_id: Some(external_id.into()),
            ..Default::default()
        }
    }

    pub fn transient(error: impl Into<String>, next_retry_at: Option<DateTime<Utc>>) -> Self {
        Self {
            error: Some(error.into()),
            failure_kind: Some(FailureKind::Transient),
            next_retry_at,
            ..Default::default()
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            failure_kind: Some(FailureKind::Permanent),
            ..Default::default()
        }
    }

    pub fn note(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Per-channel content produced by the template builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedPayload {
    /// Subject line (mail only)
    pub subject: Option<String>,
    /// Short title (e.g., "New lead: Jane Doe")
    pub title: String,
    /// Body text, already trimmed to the channel's limits
    pub body: String,
    /// Raw template data for channel-specific formatting
    pub metadata: serde_json::Value,
}

/// What happened to one channel of a dispatch call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChannelOutcome {
    /// Handed to the retry supervisor (transient failure or request timeout).
    Queued { reason: String },
    Sent { external_id: String },
    Deferred { due_at: DateTime<Utc> },
    Failed { reason: String },
}

impl ChannelOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ChannelOutcome::Failed { .. })
    }
}

/// Result of `Dispatch(request)`, keyed by channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub request_id: Uuid,
    pub outcomes: BTreeMap<Channel, ChannelOutcome>,
}

impl DispatchResult {
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            outcomes: BTreeMap::new(),
        }
    }

    /// A prior result suppresses duplicates unless every channel failed.
    pub fn suppresses_duplicates(&self) -> bool {
        self.outcomes.values().any(|o| !o.is_failed())
    }
}

/// A request parked for future dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEntry {
    pub request_id: Uuid,
    pub idempotency_key: String,
    pub channels: BTreeSet<Channel>,
    pub due_at: DateTime<Utc>,
    pub reason: ScheduleReason,
    pub request: NotificationRequest,
    /// Times this entry was re-queued after a failed re-dispatch.
    pub requeue_count: u32,
}

/// Ledger row for a submitted request, used for dedup and status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request: NotificationRequest,
    pub idempotency_key: String,
    pub result: DispatchResult,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

/// An engagement event attached to an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EngagementEvent {
    pub id: Uuid,
    pub attempt_id: Uuid,
    pub kind: EngagementKind,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
            .collect()
    }

    #[test]
    fn test_status_transitions() {
        use DeliveryStatus::*;

        assert!(Pending.can_transition_to(Sent));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Suppressed));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Sent.can_transition_to(Bounced));

        assert!(!Delivered.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Sent));
        assert!(!Sent.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Delivered));
    }

    #[test]
    fn test_notification_type_parse() {
        assert_eq!(
            "appointment_reminder".parse::<NotificationType>().unwrap(),
            NotificationType::AppointmentReminder
        );
        let err = "lead_cold".parse::<NotificationType>().unwrap_err();
        assert!(err.contains("lead_new"));
    }

    #[test]
    fn test_channel_parse_is_case_insensitive() {
        assert_eq!("SMS".parse::<Channel>().unwrap(), Channel::Sms);
        assert_eq!(" mail ".parse::<Channel>().unwrap(), Channel::Mail);
        assert!("fax".parse::<Channel>().is_err());
    }

    #[test]
    fn test_derived_key_is_deterministic() {
        let a = NotificationRequest::new(
            NotificationType::LeadNew,
            "R1",
            data(&[("lead_name", "Jane"), ("lead_source", "web")]),
        );
        let b = NotificationRequest::new(
            NotificationType::LeadNew,
            "R1",
            data(&[("lead_source", "web"), ("lead_name", "Jane")]),
        );
        assert_ne!(a.id, b.id);
        assert_eq!(a.effective_idempotency_key(), b.effective_idempotency_key());
        assert_eq!(a.effective_idempotency_key().len(), 64);
    }

    #[test]
    fn test_derived_key_changes_with_recipient() {
        let a = NotificationRequest::new(NotificationType::LeadNew, "R1", data(&[]));
        let b = NotificationRequest::new(NotificationType::LeadNew, "R2", data(&[]));
        assert_ne!(a.effective_idempotency_key(), b.effective_idempotency_key());
    }

    #[test]
    fn test_explicit_key_wins() {
        let req = NotificationRequest::new(NotificationType::LeadNew, "R1", data(&[]))
            .with_idempotency_key("lead-42");
        assert_eq!(req.effective_idempotency_key(), "lead-42");
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = ChannelOutcome::Failed {
            reason: "invalid address".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["reason"], "invalid address");
    }

    #[test]
    fn test_all_failed_result_does_not_suppress() {
        let mut result = DispatchResult::new(Uuid::new_v4());
        result.outcomes.insert(
            Channel::Mail,
            ChannelOutcome::Failed {
                reason: "bad".to_string(),
            },
        );
        assert!(!result.suppresses_duplicates());

        result.outcomes.insert(
            Channel::Sms,
            ChannelOutcome::Sent {
                external_id: "SM1".to_string(),
            },
        );
        assert!(result.suppresses_duplicates());
    }
}
