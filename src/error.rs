// ⚠️ Error taxonomy for the review pipeline
//
// Only `Validation` stops a single row. Everything else degrades to a
// reviewable state inside the pipeline and only surfaces to callers of the
// audit/override API or the persistence layer.

use thiserror::Error;

/// Result type used across the library
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed raw input field, rejected at normalization
    #[error("validation error on field '{field}' (value '{value}'): {reason}")]
    Validation {
        field: &'static str,
        value: String,
        reason: String,
    },

    /// An external tier call did not answer within its per-call timeout
    #[error("{service} timed out after {timeout_ms}ms")]
    ClassificationTimeout { service: String, timeout_ms: u64 },

    /// A compliance rule failed while evaluating
    #[error("compliance rule '{rule_id}' failed: {message}")]
    ComplianceRule { rule_id: String, message: String },

    /// Similarity or model service unreachable / returned garbage
    #[error("external service '{service}' failed: {message}")]
    ExternalService { service: String, message: String },

    /// Stale write: the override targets a version that is no longer active
    #[error("conflict on {subject}: expected {expected}, found {actual}")]
    Conflict {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("unknown subject: {subject}")]
    UnknownSubject { subject: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("extraction error: {0}")]
    Extraction(#[from] csv::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn validation(field: &'static str, value: &str, reason: impl Into<String>) -> Self {
        PipelineError::Validation {
            field,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unknown(subject: impl Into<String>) -> Self {
        PipelineError::UnknownSubject {
            subject: subject.into(),
        }
    }

    /// Field name for validation errors (None for every other kind)
    pub fn field(&self) -> Option<&'static str> {
        match self {
            PipelineError::Validation { field, .. } => Some(field),
            _ => None,
        }
    }

    /// Whether the failure should degrade to `needs_review` instead of failing
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            PipelineError::ClassificationTimeout { .. }
                | PipelineError::ExternalService { .. }
                | PipelineError::ComplianceRule { .. }
        )
    }

    /// Short machine-readable kind, used in audit payloads and API responses
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation { .. } => "validation_error",
            PipelineError::ClassificationTimeout { .. } => "classification_timeout_error",
            PipelineError::ComplianceRule { .. } => "compliance_rule_error",
            PipelineError::ExternalService { .. } => "external_service_error",
            PipelineError::Conflict { .. } => "conflict_error",
            PipelineError::UnknownSubject { .. } => "unknown_subject",
            PipelineError::Config(_) => "config_error",
            PipelineError::Storage(_) => "storage_error",
            PipelineError::Io(_) => "io_error",
            PipelineError::Extraction(_) => "extraction_error",
            PipelineError::Serialization(_) => "serialization_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_names_field() {
        let err = PipelineError::validation("amount", "abc", "no digits");
        assert_eq!(err.field(), Some("amount"));
        assert!(err.to_string().contains("'amount'"));
        assert!(!err.is_degradable());
    }

    #[test]
    fn test_degradable_kinds() {
        let timeout = PipelineError::ClassificationTimeout {
            service: "model".to_string(),
            timeout_ms: 50,
        };
        assert!(timeout.is_degradable());
        assert_eq!(timeout.kind(), "classification_timeout_error");

        let conflict = PipelineError::Conflict {
            subject: "classification".to_string(),
            expected: "1".to_string(),
            actual: "2".to_string(),
        };
        assert!(!conflict.is_degradable());
    }
}
