//! Push adapter for an HTTP push gateway.
//!
//! The gateway accepts `{token, title, body, data}` and answers with the id it
//! assigned to the message (`id`, or FCM-style `name`).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use herald_common::types::{Channel, RenderedPayload};

use crate::{ProviderAdapter, ProviderError};

#[derive(Debug, Deserialize)]
struct PushResponse {
    id: Option<String>,
    name: Option<String>,
}

/// HTTP push gateway adapter.
pub struct PushAdapter {
    client: reqwest::Client,
    gateway_url: String,
    api_key: String,
}

impl PushAdapter {
    pub fn new(
        client: reqwest::Client,
        gateway_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            gateway_url: gateway_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for PushAdapter {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    fn name(&self) -> &'static str {
        "push-gateway"
    }

    async fn send(
        &self,
        address: &str,
        payload: &RenderedPayload,
        correlation_id: Uuid,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        if address.trim().is_empty() {
            return Err(ProviderError::Permanent("empty device token".to_string()));
        }

        let body = json!({
            "token": address,
            "title": payload.title,
            "body": payload.body,
            "data": payload.metadata,
            "correlation_id": correlation_id,
        });

        let response = self
            .client
            .post(&self.gateway_url)
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &text));
        }

        let parsed: PushResponse = response.json().await?;
        Ok(parsed
            .id
            .or(parsed.name)
            .unwrap_or_else(|| correlation_id.to_string()))
    }
}
