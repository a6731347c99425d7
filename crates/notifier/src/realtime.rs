//! Realtime in-app broadcast over Redis pub/sub.
//!
//! Each recipient listens on `{prefix}:{address}`. Publishing with no live
//! subscriber still counts as sent: the in-app inbox is best effort.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde_json::json;
use uuid::Uuid;

use herald_common::types::{Channel, RenderedPayload};

use crate::{ProviderAdapter, ProviderError};

/// Redis pub/sub broadcast adapter.
pub struct RealtimeAdapter {
    redis: ConnectionManager,
    prefix: String,
}

impl RealtimeAdapter {
    pub fn new(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
        }
    }
}

fn topic(prefix: &str, address: &str) -> String {
    format!("{}:{}", prefix, address)
}

fn message(payload: &RenderedPayload, correlation_id: Uuid) -> serde_json::Value {
    json!({
        "id": correlation_id,
        "title": payload.title,
        "body": payload.body,
        "data": payload.metadata,
    })
}

#[async_trait]
impl ProviderAdapter for RealtimeAdapter {
    fn channel(&self) -> Channel {
        Channel::Realtime
    }

    fn name(&self) -> &'static str {
        "redis-pubsub"
    }

    async fn send(
        &self,
        address: &str,
        payload: &RenderedPayload,
        correlation_id: Uuid,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let mut redis = self.redis.clone();
        let topic = topic(&self.prefix, address);
        let body = message(payload, correlation_id).to_string();

        let receivers: i64 = tokio::time::timeout(
            timeout,
            redis::cmd("PUBLISH")
                .arg(&topic)
                .arg(body)
                .query_async(&mut redis),
        )
        .await
        .map_err(|_| ProviderError::Transient("redis publish timed out".to_string()))??;

        tracing::debug!(%topic, receivers, %correlation_id, "Realtime notification published");
        Ok(correlation_id.to_string())
    }
}
