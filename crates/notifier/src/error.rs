use reqwest::StatusCode;
use thiserror::Error;

use herald_common::types::FailureKind;

/// Failure reported by a provider adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Network trouble, timeouts, provider 5xx or throttling. A retry may succeed.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Invalid address, hard opt-out, provider rejection. Retrying is futile.
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// Classify a non-success HTTP response.
    ///
    /// 5xx, 408 and 429 are transient; every other 4xx is permanent.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = if body.is_empty() {
            format!("provider returned {}", status)
        } else {
            format!("provider returned {}: {}", status, truncate(body, 200))
        };

        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            ProviderError::Transient(detail)
        } else {
            ProviderError::Permanent(detail)
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ProviderError::Transient(_) => FailureKind::Transient,
            ProviderError::Permanent(_) => FailureKind::Permanent,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            ProviderError::Transient(detail) | ProviderError::Permanent(detail) => detail,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return ProviderError::from_status(status, "");
        }
        if err.is_builder() {
            // Malformed URL or request: the same call will never succeed.
            ProviderError::Permanent(format!("invalid provider request: {}", err))
        } else {
            ProviderError::Transient(format!("provider request failed: {}", err))
        }
    }
}

impl From<redis::RedisError> for ProviderError {
    fn from(err: redis::RedisError) -> Self {
        ProviderError::Transient(format!("redis error: {}", err))
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}
