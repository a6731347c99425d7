//! Template builder: turns a notification type and its data bag into
//! per-channel rendered content.
//!
//! Each type declares the fields it needs; `validate` is the schema check the
//! dispatcher runs before any attempt exists.

use std::collections::BTreeMap;

use serde_json::Value;

use herald_common::error::AppError;
use herald_common::types::{Channel, NotificationType, RenderedPayload};

/// SMS bodies longer than this are cut (two concatenated segments).
pub const SMS_MAX_CHARS: usize = 320;

/// Pure renderer for every known notification type.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateBuilder;

impl TemplateBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Fields that must be present (and non-empty) in `data` for this type.
    pub fn required_fields(notification_type: NotificationType) -> &'static [&'static str] {
        match notification_type {
            NotificationType::LeadNew => &["lead_name", "lead_source"],
            NotificationType::LeadHot => &["lead_name", "score"],
            NotificationType::LeadAssigned => &["lead_name", "assignee_name"],
            NotificationType::AppointmentReminder => &["customer_name", "appointment_time"],
            NotificationType::Escalation => &["subject", "reason"],
            NotificationType::Emergency => &["message"],
        }
    }

    /// Reject data missing any required field.
    pub fn validate(
        &self,
        notification_type: NotificationType,
        data: &BTreeMap<String, Value>,
    ) -> Result<(), AppError> {
        let missing: Vec<&str> = Self::required_fields(notification_type)
            .iter()
            .copied()
            .filter(|key| !is_present(data.get(*key)))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::InvalidPayload(format!(
                "{} requires field(s): {}",
                notification_type,
                missing.join(", ")
            )))
        }
    }

    /// Render content for one channel. Assumes `validate` already passed;
    /// absent optional values render as "unknown".
    pub fn render(
        &self,
        notification_type: NotificationType,
        data: &BTreeMap<String, Value>,
        channel: Channel,
    ) -> RenderedPayload {
        let (title, body) = match notification_type {
            NotificationType::LeadNew => {
                let name = field(data, "lead_name");
                let source = field(data, "lead_source");
                (
                    format!("New lead: {}", name),
                    format!("{} just came in via {}", name, source),
                )
            }
            NotificationType::LeadHot => {
                let name = field(data, "lead_name");
                let score = field(data, "score");
                (
                    format!("Hot lead: {}", name),
                    format!("{} scored {}. Reach out now", name, score),
                )
            }
            NotificationType::LeadAssigned => {
                let name = field(data, "lead_name");
                let assignee = field(data, "assignee_name");
                (
                    format!("Lead assigned: {}", name),
                    format!("{} has been assigned to {}", name, assignee),
                )
            }
            NotificationType::AppointmentReminder => {
                let customer = field(data, "customer_name");
                let time = field(data, "appointment_time");
                let body = match data.get("location").and_then(|v| v.as_str()) {
                    Some(location) => format!(
                        "Reminder: appointment with {} at {} ({})",
                        customer, time, location
                    ),
                    None => format!("Reminder: appointment with {} at {}", customer, time),
                };
                (format!("Appointment with {}", customer), body)
            }
            NotificationType::Escalation => {
                let subject = field(data, "subject");
                let reason = field(data, "reason");
                (format!("Escalation: {}", subject), reason)
            }
            NotificationType::Emergency => ("Emergency".to_string(), field(data, "message")),
        };

        let subject = (channel == Channel::Mail).then(|| title.clone());
        let body = match channel {
            Channel::Sms => truncate_chars(&body, SMS_MAX_CHARS),
            _ => body,
        };

        RenderedPayload {
            subject,
            title,
            body,
            metadata: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }
}

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

fn field(data: &BTreeMap<String, Value>, key: &str) -> String {
    match data.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "unknown".to_string(),
        Some(other) => other.to_string(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
