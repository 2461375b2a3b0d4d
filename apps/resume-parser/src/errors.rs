use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline stages, in the order a submission moves through them.
/// Serialized names are the ones carried by `job.resume.failed` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Received,
    Deduplicating,
    Downloading,
    ExtractingText,
    AIParsing,
    Normalizing,
    Encrypting,
    Publishing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "Received",
            Stage::Deduplicating => "Deduplicating",
            Stage::Downloading => "Downloading",
            Stage::ExtractingText => "ExtractingText",
            Stage::AIParsing => "AIParsing",
            Stage::Normalizing => "Normalizing",
            Stage::Encrypting => "Encrypting",
            Stage::Publishing => "Publishing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy of the résumé pipeline.
///
/// Validation-class variants are fatal on first occurrence. `Download` and
/// `AiParsing` carry a flag saying whether the underlying cause was transient;
/// only those consume the retry budget.
#[derive(Debug, Clone, Error)]
pub enum ParsingError {
    #[error("Invalid event data: {0}")]
    InvalidEventData(String),

    #[error("Organization ID is required")]
    OrganizationRequired,

    #[error("File validation failed: {0}")]
    FileValidation(String),

    #[error("Download failed: {message}")]
    Download { message: String, transient: bool },

    #[error("Text extraction failed: {0}")]
    Extraction(String),

    #[error("AI parsing failed: {message}")]
    AiParsing { message: String, retryable: bool },

    #[error("Field mapping failed: {0}")]
    FieldMapping(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Publish failed: {0}")]
    Publish(String),
}

impl ParsingError {
    /// Wire name of the error class, used as `error.name` in outbound events.
    pub fn name(&self) -> &'static str {
        match self {
            ParsingError::InvalidEventData(_) => "InvalidEventData",
            ParsingError::OrganizationRequired => "OrganizationRequired",
            ParsingError::FileValidation(_) => "FileValidationFailure",
            ParsingError::Download { .. } => "DownloadFailure",
            ParsingError::Extraction(_) => "ExtractionFailure",
            ParsingError::AiParsing { .. } => "AIParsingFailure",
            ParsingError::FieldMapping(_) => "FieldMappingFailure",
            ParsingError::Encryption(_) => "EncryptionFailure",
            ParsingError::Publish(_) => "PublishFailure",
        }
    }

    /// Whether a retry policy may spend another attempt on this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            ParsingError::Download { transient, .. } => *transient,
            ParsingError::AiParsing { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// Coarse classification of a failure cause from its message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

const PERMANENT_MARKERS: &[&str] = &["invalid", "validation", "corrupt", "malformed", "unsupported"];

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "connection",
    "rate limit",
    "rate-limit",
    "too many requests",
    "temporarily",
    "unavailable",
    "econnreset",
    "download",
    "storage",
];

/// Classifies an error message for adapters that only surface text.
///
/// Permanent markers win over transient ones, so "invalid response after timeout"
/// is not retried. Anything unrecognised is treated as permanent.
pub fn classify_message(message: &str) -> FailureClass {
    let lower = message.to_lowercase();
    if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return FailureClass::Permanent;
    }
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return FailureClass::Transient;
    }
    FailureClass::Permanent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_variants_are_retryable() {
        let transient_download = ParsingError::Download {
            message: "connection reset".into(),
            transient: true,
        };
        let missing_blob = ParsingError::Download {
            message: "not found".into(),
            transient: false,
        };
        assert!(transient_download.is_retryable());
        assert!(!missing_blob.is_retryable());
        assert!(!ParsingError::FileValidation("too big".into()).is_retryable());
        assert!(!ParsingError::FieldMapping("skills".into()).is_retryable());
        assert!(ParsingError::AiParsing {
            message: "429".into(),
            retryable: true
        }
        .is_retryable());
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(ParsingError::OrganizationRequired.name(), "OrganizationRequired");
        assert_eq!(
            ParsingError::AiParsing {
                message: String::new(),
                retryable: false
            }
            .name(),
            "AIParsingFailure"
        );
        assert_eq!(
            serde_json::to_value(Stage::AIParsing).unwrap(),
            serde_json::json!("AIParsing")
        );
    }

    #[test]
    fn test_classify_message() {
        assert_eq!(classify_message("Request timed out"), FailureClass::Transient);
        assert_eq!(classify_message("Rate limit exceeded"), FailureClass::Transient);
        assert_eq!(classify_message("network unreachable"), FailureClass::Transient);
        assert_eq!(classify_message("Invalid JSON after timeout"), FailureClass::Permanent);
        assert_eq!(classify_message("file is corrupt"), FailureClass::Permanent);
        assert_eq!(classify_message("something odd"), FailureClass::Permanent);
    }
}
