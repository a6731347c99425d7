//! SMS adapter backed by the Twilio Messages API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use herald_common::types::{Channel, RenderedPayload};

use crate::{ProviderAdapter, ProviderError};

const DEFAULT_BASE_URL: &str = "https://api.twilio.com";

#[derive(Debug, Deserialize)]
struct MessageResponse {
    sid: String,
}

/// Twilio SMS adapter.
pub struct SmsAdapter {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from: String,
    base_url: String,
}

impl SmsAdapter {
    pub fn new(
        client: reqwest::Client,
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            client,
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            from: from.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.account_sid
        )
    }
}

/// E.164: leading '+', then 8 to 15 digits.
fn is_e164(address: &str) -> bool {
    address
        .strip_prefix('+')
        .is_some_and(|digits| (8..=15).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit()))
}

#[async_trait]
impl ProviderAdapter for SmsAdapter {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn name(&self) -> &'static str {
        "twilio"
    }

    async fn send(
        &self,
        address: &str,
        payload: &RenderedPayload,
        correlation_id: Uuid,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        if !is_e164(address) {
            return Err(ProviderError::Permanent(format!(
                "invalid phone number '{}'",
                address
            )));
        }

        let form = [
            ("To", address),
            ("From", self.from.as_str()),
            ("Body", payload.body.as_str()),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .header("I-Twilio-Idempotency-Token", correlation_id.to_string())
            .timeout(timeout)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let parsed: MessageResponse = response.json().await?;
        tracing::debug!(message_sid = %parsed.sid, %correlation_id, "SMS accepted by provider");
        Ok(parsed.sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_e164_validation() {
        assert!(is_e164("+14155550123"));
        assert!(is_e164("+447700900123"));
        assert!(!is_e164("4155550123"));
        assert!(!is_e164("+1-415-555"));
        assert!(!is_e164("+123"));
    }

    #[test]
    fn test_messages_url() {
        let adapter = SmsAdapter::new(reqwest::Client::new(), "AC123", "token", "+15550000000")
            .with_base_url("http://localhost:9000/");
        assert_eq!(
            adapter.messages_url(),
            "http://localhost:9000/2010-04-01/Accounts/AC123/Messages.json"
        );
    }
}
