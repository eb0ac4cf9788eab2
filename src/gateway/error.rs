use serde::{Serialize, Serializer};
use std::time::Duration;
use thiserror::Error;

use crate::models::AuditOutcome;

/// Typed failure returned to business services.
///
/// Messages carry status codes and failure descriptions only. Downstream
/// bodies and credentials never end up in here.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("Authentication with the token service failed: {message}")]
    Authentication { message: String },

    #[error("Rate limit exceeded, retry after {}ms", retry_after.as_millis())]
    RateLimitExceeded { retry_after: Duration },

    #[error("Downstream service unavailable after {attempts} attempt(s): {message}")]
    TransientNetwork { attempts: u32, message: String },

    #[error("Request rejected as invalid (HTTP {status})")]
    Validation { status: u16 },

    #[error("Requested resource was not found")]
    NotFound,

    #[error("Gateway call exceeded its deadline of {}ms", after.as_millis())]
    Timeout { after: Duration },

    #[error("Unexpected gateway failure: {0}")]
    Unknown(String),
}

impl GatewayError {
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Whether the caller may try the same call again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. } | Self::TransientNetwork { .. } | Self::Timeout { .. }
        )
    }

    /// Suggested wait before retrying, when one is known
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication { .. } => "authentication_error",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::TransientNetwork { .. } => "transient_network_error",
            Self::Validation { .. } => "validation_error",
            Self::NotFound => "not_found",
            Self::Timeout { .. } => "timeout",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Audit outcome for a call that ended with this error
    pub fn outcome(&self) -> AuditOutcome {
        match self {
            Self::Authentication { .. } => AuditOutcome::AuthenticationError,
            Self::RateLimitExceeded { .. } => AuditOutcome::RateLimited,
            Self::TransientNetwork { .. } => AuditOutcome::TransientError,
            Self::Validation { .. } => AuditOutcome::ValidationError,
            Self::NotFound => AuditOutcome::NotFound,
            Self::Timeout { .. } => AuditOutcome::Timeout,
            Self::Unknown(_) => AuditOutcome::Unknown,
        }
    }

    /// Status used when the error crosses the internal HTTP surface
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Authentication { .. } => 502,
            Self::RateLimitExceeded { .. } => 429,
            Self::TransientNetwork { .. } => 503,
            Self::Validation { .. } => 400,
            Self::NotFound => 404,
            Self::Timeout { .. } => 504,
            Self::Unknown(_) => 500,
        }
    }
}

impl Serialize for GatewayError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        #[derive(Serialize)]
        struct Wire<'a> {
            kind: &'a str,
            message: String,
            retryable: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            retry_after_ms: Option<u64>,
        }

        Wire {
            kind: self.kind(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            retry_after_ms: self.retry_after().map(|d| d.as_millis() as u64),
        }
        .serialize(serializer)
    }
}
