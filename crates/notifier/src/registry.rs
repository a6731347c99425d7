//! Channel registry: maps each channel to its provider adapter.
//!
//! Adding a channel means registering an adapter here; nothing upstream
//! branches on channel type.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use herald_common::config::RateLimitConfig;
use herald_common::types::{Channel, RenderedPayload};

use crate::rate_limit::TokenBucket;
use crate::{ProviderAdapter, ProviderError};

struct RegisteredAdapter {
    adapter: Arc<dyn ProviderAdapter>,
    limiter: Option<TokenBucket>,
}

/// Registry of channel adapters used by dispatch and retry.
#[derive(Default)]
pub struct ChannelRegistry {
    adapters: HashMap<Channel, RegisteredAdapter>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the adapter for its channel, optionally rate limited.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>, limit: Option<RateLimitConfig>) {
        let channel = adapter.channel();
        tracing::info!(
            %channel,
            provider = adapter.name(),
            rate_limited = limit.is_some(),
            "Provider adapter registered"
        );
        self.adapters.insert(
            channel,
            RegisteredAdapter {
                adapter,
                limiter: limit.as_ref().map(TokenBucket::from_config),
            },
        );
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_adapter(
        mut self,
        adapter: Arc<dyn ProviderAdapter>,
        limit: Option<RateLimitConfig>,
    ) -> Self {
        self.register(adapter, limit);
        self
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.adapters.contains_key(&channel)
    }

    pub fn channels(&self) -> BTreeSet<Channel> {
        self.adapters.keys().copied().collect()
    }

    /// Send through the channel's adapter.
    ///
    /// `timeout` bounds the whole call: waiting for a rate-limit token and the
    /// provider round trip share the same budget. Exceeding it is transient.
    pub async fn send(
        &self,
        channel: Channel,
        address: &str,
        payload: &RenderedPayload,
        correlation_id: Uuid,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let entry = self.adapters.get(&channel).ok_or_else(|| {
            ProviderError::Permanent(format!("no provider registered for channel {}", channel))
        })?;

        let deadline = Instant::now() + timeout;

        if let Some(limiter) = &entry.limiter {
            limiter.acquire(timeout).await.map_err(|e| {
                tracing::warn!(%channel, "Rate limit wait exceeded channel timeout");
                ProviderError::Transient(format!("rate limited: {}", e))
            })?;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(
            remaining,
            entry.adapter.send(address, payload, correlation_id, remaining),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Transient(format!(
                "{} call timed out after {:?}",
                entry.adapter.name(),
                timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct SlowAdapter {
        delay: Duration,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProviderAdapter for SlowAdapter {
        fn channel(&self) -> Channel {
            Channel::Push
        }

        fn name(&self) -> &'static str {
            "slow"
        }

        async fn send(
            &self,
            _address: &str,
            _payload: &RenderedPayload,
            correlation_id: Uuid,
            _timeout: Duration,
        ) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(correlation_id.to_string())
        }
    }

    fn payload() -> RenderedPayload {
        RenderedPayload {
            subject: None,
            title: "t".to_string(),
            body: "b".to_string(),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_unregistered_channel_is_permanent() {
        let registry = ChannelRegistry::new();
        let err = registry
            .send(Channel::Sms, "+15550001111", &payload(), Uuid::new_v4(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out_as_transient() {
        let adapter = Arc::new(SlowAdapter {
            delay: Duration::from_secs(30),
            calls: AtomicU32::new(0),
        });
        let registry = ChannelRegistry::new().with_adapter(adapter.clone(), None);

        let err = registry
            .send(Channel::Push, "token", &payload(), Uuid::new_v4(), Duration::from_secs(10))
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert!(err.detail().contains("timed out"));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_bucket_becomes_transient_backpressure() {
        let adapter = Arc::new(SlowAdapter {
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        });
        let limit = RateLimitConfig {
            per_second: 0.01,
            burst: 1,
        };
        let registry = ChannelRegistry::new().with_adapter(adapter.clone(), Some(limit));

        registry
            .send(Channel::Push, "token", &payload(), Uuid::new_v4(), Duration::from_secs(1))
            .await
            .unwrap();
        let err = registry
            .send(Channel::Push, "token", &payload(), Uuid::new_v4(), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channels_listing() {
        let adapter = Arc::new(SlowAdapter {
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        });
        let registry = ChannelRegistry::new().with_adapter(adapter, None);
        assert!(registry.contains(Channel::Push));
        assert!(!registry.contains(Channel::Mail));
        assert_eq!(registry.channels(), BTreeSet::from([Channel::Push]));
    }
}
