//! HTTP surface of the notification engine: submission, status query,
//! cancellation, provider engagement webhooks and health.

pub mod routes;
pub mod state;
