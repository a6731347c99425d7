//! Mail adapter backed by the Resend HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use herald_common::types::{Channel, RenderedPayload};

use crate::{ProviderAdapter, ProviderError};

const DEFAULT_BASE_URL: &str = "https://api.resend.com";

#[derive(Debug, Deserialize)]
struct SendEmailResponse {
    id: String,
}

/// Resend mail adapter.
pub struct MailAdapter {
    client: reqwest::Client,
    api_key: String,
    from: String,
    base_url: String,
}

impl MailAdapter {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            from: from.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point the adapter at a different API host (used by tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn build_body(&self, address: &str, payload: &RenderedPayload) -> serde_json::Value {
        json!({
            "from": self.from,
            "to": [address],
            "subject": payload.subject.as_deref().unwrap_or(&payload.title),
            "text": payload.body,
        })
    }
}

#[async_trait]
impl ProviderAdapter for MailAdapter {
    fn channel(&self) -> Channel {
        Channel::Mail
    }

    fn name(&self) -> &'static str {
        "resend"
    }

    async fn send(
        &self,
        address: &str,
        payload: &RenderedPayload,
        correlation_id: Uuid,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        if !address.contains('@') {
            return Err(ProviderError::Permanent(format!(
                "invalid mail address '{}'",
                address
            )));
        }

        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", correlation_id.to_string())
            .timeout(timeout)
            .json(&self.build_body(address, payload))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let parsed: SendEmailResponse = response.json().await?;
        tracing::debug!(email_id = %parsed.id, %correlation_id, "Mail accepted by provider");
        Ok(parsed.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(subject: Option<&str>) -> RenderedPayload {
        RenderedPayload {
            subject: subject.map(str::to_string),
            title: "New lead: Jane".to_string(),
            body: "Jane came in from web".to_string(),
            metadata: json!({}),
        }
    }

    #[test]
    fn test_body_uses_subject() {
        let adapter = MailAdapter::new(reqwest::Client::new(), "key", "crm@example.com");
        let body = adapter.build_body("agent@example.com", &payload(Some("Hello")));
        assert_eq!(body["from"], "crm@example.com");
        assert_eq!(body["to"][0], "agent@example.com");
        assert_eq!(body["subject"], "Hello");
        assert_eq!(body["text"], "Jane came in from web");
    }

    #[test]
    fn test_body_falls_back_to_title() {
        let adapter = MailAdapter::new(reqwest::Client::new(), "key", "crm@example.com");
        let body = adapter.build_body("agent@example.com", &payload(None));
        assert_eq!(body["subject"], "New lead: Jane");
    }

    #[tokio::test]
    async fn test_malformed_address_is_permanent() {
        let adapter = MailAdapter::new(reqwest::Client::new(), "key", "crm@example.com");
        let err = adapter
            .send(
                "not-an-address",
                &payload(None),
                Uuid::new_v4(),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
