//! Error taxonomy (§7). One variant per row of the error table; each carries
//! what's needed to render the `{error: ...}` JSON body and HTTP status.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("no credentials configured for provider {provider}")]
    AuthMissing { provider: String },

    /// Retries not yet exhausted; the dispatch engine surfaces this only if
    /// it gives up before a successful attempt.
    #[error("rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimitTransient {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("all candidate providers are cooled down")]
    RateLimitExhausted,

    /// Upstream returned a non-429 4xx/5xx JSON body; passed through
    /// unchanged with the original status.
    #[error("upstream error ({status}): {body}")]
    UpstreamError {
        status: u16,
        body: serde_json::Value,
    },

    #[error("upstream returned non-JSON error body: {0}")]
    UpstreamNonJson(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream model returned empty response (0 tokens)")]
    StreamEmpty,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// HTTP status this error renders as, per §7. `UpstreamError` is the one
    /// variant whose status is data, not fixed.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::InvalidRequest(_) => 400,
            ProxyError::AuthMissing { .. } => 401,
            ProxyError::RateLimitTransient { .. } => 429,
            ProxyError::RateLimitExhausted => 429,
            ProxyError::UpstreamError { status, .. } => *status,
            ProxyError::UpstreamNonJson(_) => 502,
            ProxyError::Network(_) => 502,
            ProxyError::StreamEmpty => 200,
            ProxyError::Internal(_) => 500,
        }
    }

    /// The JSON body's `error` payload.
    pub fn body(&self) -> serde_json::Value {
        match self {
            ProxyError::RateLimitExhausted => {
                serde_json::json!({ "code": "all_providers_cooldown" })
            }
            ProxyError::UpstreamError { body, .. } => body.clone(),
            ProxyError::AuthMissing { provider } => {
                serde_json::json!({ "message": format!("missing credentials for {provider}") })
            }
            other => serde_json::json!({ "message": other.to_string() }),
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
