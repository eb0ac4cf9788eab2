use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppError;

/// Data domain an audited call belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Demographics,
    Prescriptions,
    Exemptions,
    Eligibility,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Demographics => "demographics",
            Self::Prescriptions => "prescriptions",
            Self::Exemptions => "exemptions",
            Self::Eligibility => "eligibility",
        }
    }
}

impl std::str::FromStr for AuditCategory {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "demographics" => Ok(Self::Demographics),
            "prescriptions" => Ok(Self::Prescriptions),
            "exemptions" => Ok(Self::Exemptions),
            "eligibility" => Ok(Self::Eligibility),
            other => Err(AppError::Audit(format!("Unknown audit category: {}", other))),
        }
    }
}

/// Terminal state of one gateway call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    RateLimited,
    AuthenticationError,
    TransientError,
    ValidationError,
    NotFound,
    Timeout,
    Unknown,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RateLimited => "rate_limited",
            Self::AuthenticationError => "authentication_error",
            Self::TransientError => "transient_error",
            Self::ValidationError => "validation_error",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for AuditOutcome {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "rate_limited" => Ok(Self::RateLimited),
            "authentication_error" => Ok(Self::AuthenticationError),
            "transient_error" => Ok(Self::TransientError),
            "validation_error" => Ok(Self::ValidationError),
            "not_found" => Ok(Self::NotFound),
            "timeout" => Ok(Self::Timeout),
            "unknown" => Ok(Self::Unknown),
            other => Err(AppError::Audit(format!("Unknown audit outcome: {}", other))),
        }
    }
}

/// Evidence of one external call. Append-only; never mutated after persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub category: AuditCategory,
    pub channel: String,
    /// Only the trailing characters survive masking
    pub masked_subject_id: Option<String>,
    pub outcome: AuditOutcome,
    pub attempts: u32,
    pub cache_hit: bool,
    pub duration_ms: u64,
    pub tenant_id: Option<String>,
    pub actor: Option<String>,
    /// Masked free-form details
    pub context: Value,
    pub prev_hash: String,
    pub hash: String,
}

/// Filter for the reporting side of the audit store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    pub category: Option<AuditCategory>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(category) = self.category {
            if record.category != category {
                return false;
            }
        }
        if let Some(from) = self.from {
            if record.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if record.timestamp > to {
                return false;
            }
        }
        true
    }
}
