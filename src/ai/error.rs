//! AI pipeline error types

use thiserror::Error;

use super::rate_limit::RateDecision;
use super::vault::VaultError;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("Rate limited: {}", .0.message)]
    RateLimited(RateDecision),

    #[error("No AI configuration for this user")]
    ConfigMissing,

    #[error("Request blocked: sensitive data detected")]
    SecurityBlocked,

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Upstream returned status {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("Upstream timed out")]
    Timeout,

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AiError {
    /// Stable wire code carried in `/ai` error frames.
    pub fn code(&self) -> &'static str {
        match self {
            AiError::RateLimited(decision) => decision.reason.unwrap_or("RATE_LIMITED"),
            AiError::ConfigMissing => "configMissing",
            AiError::SecurityBlocked => "securityBlocked",
            AiError::Upstream(_) => "upstreamUnreachable",
            AiError::UpstreamStatus { .. } => "upstreamRejected",
            AiError::Timeout => "timeout",
            AiError::Vault(_) => "internal",
            AiError::Internal(_) => "internal",
        }
    }

    /// Message fit for the client; secrets never appear here because inputs
    /// are redacted before any error can echo them.
    pub fn client_message(&self) -> String {
        match self {
            AiError::Vault(_) | AiError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}
