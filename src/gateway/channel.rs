// Channels and the operations business services may request

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::cache::DataType;
use super::error::GatewayError;
use crate::models::AuditCategory;

pub const ACCEPT_FHIR: &str = "application/fhir+json";
pub const ACCEPT_JSON: &str = "application/json";

const PDS_BASE: &[&str] = &["personal-demographics", "FHIR", "R4"];
const EPS_BASE: &[&str] = &["prescriptions", "FHIR", "R4"];
const EXEMPTIONS_BASE: &[&str] = &["exemptions", "v1"];

/// Named downstream API category with its own budget and cache policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Demographics,
    Prescriptions,
    Exemptions,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Demographics => "demographics",
            Self::Prescriptions => "prescriptions",
            Self::Exemptions => "exemptions",
        }
    }

    pub fn accept(&self) -> &'static str {
        match self {
            Self::Demographics | Self::Prescriptions => ACCEPT_FHIR,
            Self::Exemptions => ACCEPT_JSON,
        }
    }
}

/// A downstream read requested by a business service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    /// Patient record by NHS number
    PatientLookup { nhs_number: String },
    /// Prescriptions issued to a patient
    PrescriptionList { nhs_number: String },
    /// One prescription by id
    PrescriptionDetail { prescription_id: String },
    /// Current prescription charge exemption
    ExemptionCheck { nhs_number: String },
    /// Whether a patient is eligible for a given service
    EligibilityCheck { nhs_number: String, service: String },
}

impl Operation {
    pub fn channel(&self) -> Channel {
        match self {
            Self::PatientLookup { .. } => Channel::Demographics,
            Self::PrescriptionList { .. } | Self::PrescriptionDetail { .. } => {
                Channel::Prescriptions
            }
            Self::ExemptionCheck { .. } | Self::EligibilityCheck { .. } => Channel::Exemptions,
        }
    }

    /// Data type selecting the cache TTL
    pub fn data_type(&self) -> DataType {
        match self {
            Self::PatientLookup { .. } => DataType::Demographics,
            Self::PrescriptionList { .. } | Self::PrescriptionDetail { .. } => {
                DataType::Prescriptions
            }
            Self::ExemptionCheck { .. } => DataType::ExemptionStatus,
            Self::EligibilityCheck { .. } => DataType::Eligibility,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::PatientLookup { .. } => "patient.read",
            Self::PrescriptionList { .. } => "prescription.search",
            Self::PrescriptionDetail { .. } => "prescription.read",
            Self::ExemptionCheck { .. } => "exemption.check",
            Self::EligibilityCheck { .. } => "eligibility.check",
        }
    }

    pub fn category(&self) -> AuditCategory {
        match self {
            Self::PatientLookup { .. } => AuditCategory::Demographics,
            Self::PrescriptionList { .. } | Self::PrescriptionDetail { .. } => {
                AuditCategory::Prescriptions
            }
            Self::ExemptionCheck { .. } => AuditCategory::Exemptions,
            Self::EligibilityCheck { .. } => AuditCategory::Eligibility,
        }
    }

    /// Patient identifier the call concerns, if any
    pub fn subject_id(&self) -> Option<&str> {
        match self {
            Self::PatientLookup { nhs_number }
            | Self::PrescriptionList { nhs_number }
            | Self::ExemptionCheck { nhs_number }
            | Self::EligibilityCheck { nhs_number, .. } => Some(nhs_number),
            Self::PrescriptionDetail { .. } => None,
        }
    }

    /// Path segments below the environment base URL
    pub fn path_segments(&self) -> Vec<String> {
        let (base, tail): (&[&str], Vec<String>) = match self {
            Self::PatientLookup { nhs_number } => {
                (PDS_BASE, vec!["Patient".to_string(), nhs_number.clone()])
            }
            Self::PrescriptionList { .. } => (EPS_BASE, vec!["MedicationRequest".to_string()]),
            Self::PrescriptionDetail { prescription_id } => (
                EPS_BASE,
                vec!["MedicationRequest".to_string(), prescription_id.clone()],
            ),
            Self::ExemptionCheck { .. } => {
                (EXEMPTIONS_BASE, vec!["exemption-status".to_string()])
            }
            Self::EligibilityCheck { .. } => (EXEMPTIONS_BASE, vec!["eligibility".to_string()]),
        };
        base.iter().map(|s| s.to_string()).chain(tail).collect()
    }

    pub fn query(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::PrescriptionList { nhs_number } => vec![("patient", nhs_number.clone())],
            Self::ExemptionCheck { nhs_number } => vec![("nhsNumber", nhs_number.clone())],
            Self::EligibilityCheck {
                nhs_number,
                service,
            } => vec![
                ("nhsNumber", nhs_number.clone()),
                ("service", service.clone()),
            ],
            Self::PatientLookup { .. } | Self::PrescriptionDetail { .. } => Vec::new(),
        }
    }

    /// Memoization key, without tenant scope
    pub fn cache_key(&self) -> String {
        match self {
            Self::PatientLookup { nhs_number } => format!("patient:{}", nhs_number),
            Self::PrescriptionList { nhs_number } => format!("prescriptions:{}", nhs_number),
            Self::PrescriptionDetail { prescription_id } => {
                format!("prescription:{}", prescription_id)
            }
            Self::ExemptionCheck { nhs_number } => format!("exemption:{}", nhs_number),
            Self::EligibilityCheck {
                nhs_number,
                service,
            } => format!("eligibility:{}:{}", service, nhs_number),
        }
    }

    /// Reject malformed identifiers before spending budget on them
    pub fn validate(&self) -> Result<(), GatewayError> {
        if let Some(nhs_number) = self.subject_id() {
            if !is_valid_nhs_number(nhs_number) {
                return Err(GatewayError::Validation { status: 400 });
            }
        }
        match self {
            Self::PrescriptionDetail { prescription_id } if !is_safe_id(prescription_id) => {
                Err(GatewayError::Validation { status: 400 })
            }
            Self::EligibilityCheck { service, .. } if !is_safe_id(service) => {
                Err(GatewayError::Validation { status: 400 })
            }
            _ => Ok(()),
        }
    }
}

/// Ten digits with a valid modulus 11 check digit
pub fn is_valid_nhs_number(candidate: &str) -> bool {
    let digits: Vec<u32> = match candidate.chars().map(|c| c.to_digit(10)).collect() {
        Some(digits) => digits,
        None => return false,
    };
    if digits.len() != 10 {
        return false;
    }

    let sum: u32 = digits[..9]
        .iter()
        .zip((2..=10).rev())
        .map(|(d, w)| d * w)
        .sum();
    let check = match 11 - (sum % 11) {
        11 => 0,
        10 => return false,
        n => n,
    };
    check == digits[9]
}

fn is_safe_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Request envelope accepted by `GatewayClient::call`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub operation: Operation,
    /// Owning tenant; isolates cached responses
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// User or service on whose behalf the call is made
    #[serde(default)]
    pub actor: Option<String>,
    /// Overrides the configured deadline
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Skip the cache in both directions (e.g. just before dispensing)
    #[serde(default)]
    pub fresh: bool,
}

impl GatewayRequest {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            tenant_id: None,
            actor: None,
            timeout_ms: None,
            fresh: false,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn fresh(mut self) -> Self {
        self.fresh = true;
        self
    }

    pub fn channel(&self) -> Channel {
        self.operation.channel()
    }

    pub fn cache_key(&self) -> String {
        match &self.tenant_id {
            Some(tenant) => format!("{}:{}", tenant, self.operation.cache_key()),
            None => self.operation.cache_key(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nhs_number_checksum() {
        assert!(is_valid_nhs_number("9434765870"));
        assert!(is_valid_nhs_number("9000000009"));
        assert!(!is_valid_nhs_number("9434765871"));
        assert!(!is_valid_nhs_number("943476587"));
        assert!(!is_valid_nhs_number("94347658a0"));
    }

    #[test]
    fn test_operation_routing() {
        let lookup = Operation::PatientLookup {
            nhs_number: "9434765870".to_string(),
        };
        assert_eq!(lookup.channel(), Channel::Demographics);
        assert_eq!(lookup.channel().accept(), ACCEPT_FHIR);
        assert_eq!(lookup.data_type(), DataType::Demographics);
        assert_eq!(
            lookup.path_segments().join("/"),
            "personal-demographics/FHIR/R4/Patient/9434765870"
        );

        let exemption = Operation::ExemptionCheck {
            nhs_number: "9434765870".to_string(),
        };
        assert_eq!(exemption.channel(), Channel::Exemptions);
        assert_eq!(exemption.channel().accept(), ACCEPT_JSON);
        assert_eq!(exemption.query(), vec![("nhsNumber", "9434765870".to_string())]);

        let rx = Operation::PrescriptionList {
            nhs_number: "9434765870".to_string(),
        };
        assert_eq!(rx.data_type(), DataType::Prescriptions);
        assert_eq!(rx.category(), AuditCategory::Prescriptions);
    }

    #[test]
    fn test_validation_rejects_bad_identifiers() {
        let bad = Operation::PatientLookup {
            nhs_number: "1234567890".to_string(),
        };
        assert_eq!(bad.validate(), Err(GatewayError::Validation { status: 400 }));

        let traversal = Operation::PrescriptionDetail {
            prescription_id: "../admin".to_string(),
        };
        assert!(traversal.validate().is_err());

        let ok = Operation::PrescriptionDetail {
            prescription_id: "16B2E0-A83008-81C13H".to_string(),
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_request_deserializes_with_defaults_and_tenant_scoped_key() {
        let request: GatewayRequest = serde_json::from_str(
            r#"{"operation":{"type":"patient_lookup","nhs_number":"9434765870"},"tenant_id":"t1"}"#,
        )
        .unwrap();
        assert_eq!(request.channel(), Channel::Demographics);
        assert_eq!(request.cache_key(), "t1:patient:9434765870");
        assert!(request.timeout_ms.is_none());
        assert!(!request.fresh);
    }
}
