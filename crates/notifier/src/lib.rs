//! Provider adapters for notification delivery.
//!
//! One adapter per channel, all behind the uniform [`ProviderAdapter`] contract:
//! - Mail (Resend HTTP API)
//! - SMS (Twilio Messages API)
//! - Push (HTTP push gateway)
//! - Realtime (Redis pub/sub broadcast)
//!
//! The [`registry::ChannelRegistry`] maps each channel to its adapter and puts a
//! token-bucket limiter in front of it, so callers never branch on channel type.

pub mod error;
pub mod mail;
pub mod push;
pub mod rate_limit;
pub mod realtime;
pub mod registry;
pub mod sms;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use herald_common::types::{Channel, RenderedPayload};

pub use error::ProviderError;
pub use registry::ChannelRegistry;

/// Contract implemented by every channel integration.
///
/// Implementations must be safe to call concurrently and must give up within
/// `timeout`. A retry may call `send` again for the same logical message, so the
/// adapter should pass `correlation_id` on as a provider idempotency key where
/// the provider supports one.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// The channel this adapter delivers on.
    fn channel(&self) -> Channel;

    /// Human-readable provider name (e.g., "resend").
    fn name(&self) -> &'static str;

    /// Deliver `payload` to `address`. Returns the provider's delivery id.
    async fn send(
        &self,
        address: &str,
        payload: &RenderedPayload,
        correlation_id: Uuid,
        timeout: Duration,
    ) -> Result<String, ProviderError>;
}
