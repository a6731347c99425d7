//! Preference resolver: turns a recipient reference into a delivery decision snapshot.
//!
//! The snapshot is used for one dispatch decision and never persisted by the
//! engine; the source of truth is the recipient store behind the resolver.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use herald_common::error::AppError;
use herald_common::types::{Channel, NotificationRequest, NotificationType};

use crate::quiet_hours::QuietHours;

/// Resolved delivery preferences for one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientPreference {
    pub recipient_ref: String,
    pub enabled_channels: BTreeSet<Channel>,
    pub quiet_hours: Option<QuietHours>,
    pub timezone: Tz,
    pub opt_outs: BTreeSet<NotificationType>,
    /// Contact address per channel (mail address, E.164 number, device token, user id)
    pub addresses: BTreeMap<Channel, String>,
}

impl RecipientPreference {
    /// A recipient with nothing enabled, in UTC.
    pub fn new(recipient_ref: impl Into<String>) -> Self {
        Self {
            recipient_ref: recipient_ref.into(),
            enabled_channels: BTreeSet::new(),
            quiet_hours: None,
            timezone: chrono_tz::UTC,
            opt_outs: BTreeSet::new(),
            addresses: BTreeMap::new(),
        }
    }

    /// Enable `channel` and set its contact address.
    pub fn with_channel(mut self, channel: Channel, address: impl Into<String>) -> Self {
        self.enabled_channels.insert(channel);
        self.addresses.insert(channel, address.into());
        self
    }

    pub fn with_quiet_hours(mut self, quiet_hours: QuietHours, timezone: Tz) -> Self {
        self.quiet_hours = Some(quiet_hours);
        self.timezone = timezone;
        self
    }

    pub fn with_opt_out(mut self, notification_type: NotificationType) -> Self {
        self.opt_outs.insert(notification_type);
        self
    }

    pub fn address(&self, channel: Channel) -> Option<&str> {
        self.addresses.get(&channel).map(String::as_str)
    }

    /// Channels this request may use: enabled, addressable, not opted out,
    /// and within the caller's explicit channel set when one was given.
    pub fn eligible_channels(&self, request: &NotificationRequest) -> BTreeSet<Channel> {
        if self.opt_outs.contains(&request.notification_type) {
            return BTreeSet::new();
        }

        self.enabled_channels
            .iter()
            .copied()
            .filter(|channel| {
                request
                    .requested_channels
                    .as_ref()
                    .is_none_or(|requested| requested.contains(channel))
            })
            .filter(|channel| self.address(*channel).is_some_and(|a| !a.is_empty()))
            .collect()
    }

    pub fn in_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        self.quiet_hours
            .is_some_and(|qh| qh.contains(now, self.timezone))
    }

    /// When the current quiet window ends, if `now` is inside one.
    pub fn quiet_hours_end(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.quiet_hours
            .filter(|qh| qh.contains(now, self.timezone))
            .map(|qh| qh.next_end(now, self.timezone))
    }

    /// Until when `channel` must hold this request back, if at all.
    ///
    /// Exempt channels and emergency overrides are never held.
    pub fn quiet_hours_deferral(
        &self,
        request: &NotificationRequest,
        channel: Channel,
        exempt: &BTreeSet<Channel>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if exempt.contains(&channel) || request.override_quiet_hours {
            return None;
        }
        self.quiet_hours_end(now)
    }
}

/// Source of recipient preferences.
#[async_trait]
pub trait PreferenceResolver: Send + Sync {
    /// Resolve a recipient. Unknown recipients are `AppError::NotFound`.
    async fn resolve(&self, recipient_ref: &str) -> Result<RecipientPreference, AppError>;
}

/// In-memory resolver for tests and single-node deployments seeded from config.
#[derive(Default)]
pub struct StaticPreferenceResolver {
    preferences: RwLock<HashMap<String, RecipientPreference>>,
}

impl StaticPreferenceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, preference: RecipientPreference) -> Self {
        self.upsert(preference);
        self
    }

    /// Insert or replace a recipient's preferences.
    pub fn upsert(&self, preference: RecipientPreference) {
        self.preferences
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(preference.recipient_ref.clone(), preference);
    }
}

#[async_trait]
impl PreferenceResolver for StaticPreferenceResolver {
    async fn resolve(&self, recipient_ref: &str) -> Result<RecipientPreference, AppError> {
        self.preferences
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(recipient_ref)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Recipient {} not found", recipient_ref)))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PreferenceRow {
    recipient_ref: String,
    enabled_channels: Vec<String>,
    quiet_start_hour: Option<i16>,
    quiet_end_hour: Option<i16>,
    timezone: String,
    opt_outs: Vec<String>,
    addresses: sqlx::types::Json<BTreeMap<Channel, String>>,
}

impl PreferenceRow {
    fn into_preference(self) -> RecipientPreference {
        let timezone = self.timezone.parse::<Tz>().unwrap_or_else(|_| {
            tracing::warn!(
                recipient_ref = %self.recipient_ref,
                timezone = %self.timezone,
                "Unknown timezone, falling back to UTC"
            );
            chrono_tz::UTC
        });

        let quiet_hours = match (self.quiet_start_hour, self.quiet_end_hour) {
            (Some(start), Some(end)) => u8::try_from(start)
                .ok()
                .zip(u8::try_from(end).ok())
                .and_then(|(s, e)| QuietHours::new(s, e).ok()),
            _ => None,
        };

        let enabled_channels = self
            .enabled_channels
            .iter()
            .filter_map(|raw| raw.parse::<Channel>().ok())
            .collect();

        let opt_outs = self
            .opt_outs
            .iter()
            .filter_map(|raw| raw.parse::<NotificationType>().ok())
            .collect();

        RecipientPreference {
            recipient_ref: self.recipient_ref,
            enabled_channels,
            quiet_hours,
            timezone,
            opt_outs,
            addresses: self.addresses.0,
        }
    }
}

/// Resolver backed by the `recipient_preferences` table.
#[derive(Clone)]
pub struct PgPreferenceResolver {
    pool: PgPool,
}

impl PgPreferenceResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or replace a recipient's preferences.
    pub async fn upsert(&self, preference: &RecipientPreference) -> Result<(), AppError> {
        let channels: Vec<String> = preference
            .enabled_channels
            .iter()
            .map(|c| c.to_string())
            .collect();
        let opt_outs: Vec<String> = preference.opt_outs.iter().map(|t| t.to_string()).collect();

        sqlx::query(
            r#"
            INSERT INTO recipient_preferences
                (recipient_ref, enabled_channels, quiet_start_hour, quiet_end_hour, timezone, opt_outs, addresses, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (recipient_ref) DO UPDATE SET
                enabled_channels = EXCLUDED.enabled_channels,
                quiet_start_hour = EXCLUDED.quiet_start_hour,
                quiet_end_hour = EXCLUDED.quiet_end_hour,
                timezone = EXCLUDED.timezone,
                opt_outs = EXCLUDED.opt_outs,
                addresses = EXCLUDED.addresses,
                updated_at = NOW()
            "#,
        )
        .bind(&preference.recipient_ref)
        .bind(&channels)
        .bind(preference.quiet_hours.map(|qh| i16::from(qh.start_hour)))
        .bind(preference.quiet_hours.map(|qh| i16::from(qh.end_hour)))
        .bind(preference.timezone.name())
        .bind(&opt_outs)
        .bind(sqlx::types::Json(&preference.addresses))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl PreferenceResolver for PgPreferenceResolver {
    async fn resolve(&self, recipient_ref: &str) -> Result<RecipientPreference, AppError> {
        let row: PreferenceRow = sqlx::query_as(
            r#"
            SELECT recipient_ref, enabled_channels, quiet_start_hour, quiet_end_hour,
                   timezone, opt_outs, addresses
            FROM recipient_preferences
            WHERE recipient_ref = $1
            "#,
        )
        .bind(recipient_ref)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Recipient {} not found", recipient_ref)))?;

        Ok(row.into_preference())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn request(channels: Option<&[Channel]>) -> NotificationRequest {
        let req = NotificationRequest::new(NotificationType::LeadNew, "R1", BTreeMap::new());
        match channels {
            Some(c) => req.with_channels(c.iter().copied()),
            None => req,
        }
    }

    fn preference() -> RecipientPreference {
        RecipientPreference::new("R1")
            .with_channel(Channel::Mail, "agent@example.com")
            .with_channel(Channel::Sms, "+15550001111")
    }

    #[test]
    fn test_all_enabled_channels_when_none_requested() {
        let eligible = preference().eligible_channels(&request(None));
        assert_eq!(eligible, BTreeSet::from([Channel::Mail, Channel::Sms]));
    }

    #[test]
    fn test_requested_channels_are_intersected() {
        let eligible = preference().eligible_channels(&request(Some(&[Channel::Sms, Channel::Push])));
        assert_eq!(eligible, BTreeSet::from([Channel::Sms]));
    }

    #[test]
    fn test_opt_out_removes_everything() {
        let pref = preference().with_opt_out(NotificationType::LeadNew);
        assert!(pref.eligible_channels(&request(None)).is_empty());
    }

    #[test]
    fn test_enabled_channel_without_address_is_ineligible() {
        let mut pref = preference();
        pref.enabled_channels.insert(Channel::Push);
        let eligible = pref.eligible_channels(&request(None));
        assert!(!eligible.contains(&Channel::Push));
    }

    #[test]
    fn test_quiet_hours_end() {
        let tz = chrono_tz::America::Chicago;
        let pref = preference().with_quiet_hours(QuietHours::new(22, 8).unwrap(), tz);

        let late = tz.with_ymd_and_hms(2025, 1, 10, 23, 30, 0).unwrap().with_timezone(&Utc);
        let morning = tz.with_ymd_and_hms(2025, 1, 11, 8, 0, 0).unwrap().with_timezone(&Utc);
        assert!(pref.in_quiet_hours(late));
        assert_eq!(pref.quiet_hours_end(late), Some(morning));

        let noon = tz.with_ymd_and_hms(2025, 1, 10, 12, 0, 0).unwrap().with_timezone(&Utc);
        assert!(!pref.in_quiet_hours(noon));
        assert_eq!(pref.quiet_hours_end(noon), None);
    }

    #[test]
    fn test_quiet_hours_deferral_per_channel() {
        let tz = chrono_tz::America::Chicago;
        let pref = preference().with_quiet_hours(QuietHours::new(22, 8).unwrap(), tz);
        let late = tz.with_ymd_and_hms(2025, 1, 10, 23, 30, 0).unwrap().with_timezone(&Utc);
        let exempt = BTreeSet::from([Channel::Realtime]);

        let req = request(None);
        assert!(pref.quiet_hours_deferral(&req, Channel::Sms, &exempt, late).is_some());
        assert!(pref.quiet_hours_deferral(&req, Channel::Realtime, &exempt, late).is_none());

        let emergency = NotificationRequest::new(NotificationType::Emergency, "R1", BTreeMap::new())
            .with_quiet_hours_override();
        assert!(pref.quiet_hours_deferral(&emergency, Channel::Sms, &exempt, late).is_none());
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticPreferenceResolver::new().with(preference());
        let pref = resolver.resolve("R1").await.unwrap();
        assert_eq!(pref.address(Channel::Mail), Some("agent@example.com"));

        let err = resolver.resolve("nobody").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        resolver.upsert(RecipientPreference::new("R1"));
        assert!(resolver.resolve("R1").await.unwrap().enabled_channels.is_empty());
    }

    #[test]
    fn test_row_conversion_skips_unknown_values() {
        let row = PreferenceRow {
            recipient_ref: "R9".to_string(),
            enabled_channels: vec!["mail".to_string(), "pager".to_string()],
            quiet_start_hour: Some(22),
            quiet_end_hour: Some(7),
            timezone: "Mars/Olympus".to_string(),
            opt_outs: vec!["lead_hot".to_string(), "bogus".to_string()],
            addresses: sqlx::types::Json(BTreeMap::from([(Channel::Mail, "a@b.c".to_string())])),
        };
        let pref = row.into_preference();
        assert_eq!(pref.enabled_channels, BTreeSet::from([Channel::Mail]));
        assert_eq!(pref.opt_outs, BTreeSet::from([NotificationType::LeadHot]));
        assert_eq!(pref.timezone, chrono_tz::UTC);
        assert_eq!(pref.quiet_hours, Some(QuietHours { start_hour: 22, end_hour: 7 }));
    }
}
