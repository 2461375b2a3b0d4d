use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ParsingError, Stage};
use crate::models::resume::{SecuredResume, SecurityMetadata};
use crate::registry::ProcessingKey;

pub const SUBMITTED_SUBJECT: &str = "job.resume.submitted";
pub const PARSED_SUBJECT: &str = "analysis.resume.parsed";
pub const FAILED_SUBJECT: &str = "job.resume.failed";
pub const PROCESSING_ERROR_SUBJECT: &str = "resume.processing.error";

/// Optional hints attached by the upload flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub size: Option<u64>,
    pub mime_type: Option<String>,
}

/// Inbound `job.resume.submitted` payload as it arrives on the wire.
/// Every field is optional here; `validate` decides what is acceptable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionEvent {
    pub job_id: Option<String>,
    pub resume_id: Option<String>,
    pub original_filename: Option<String>,
    #[serde(alias = "fileRef")]
    pub temp_file_ref: Option<String>,
    pub organization_id: Option<String>,
    pub file_metadata: Option<FileMetadata>,
}

/// A submission whose required fields are all present.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub job_id: String,
    pub resume_id: String,
    pub original_filename: String,
    pub file_ref: String,
    pub organization_id: String,
    pub file_metadata: Option<FileMetadata>,
}

impl Submission {
    pub fn key(&self) -> ProcessingKey {
        ProcessingKey::new(&self.resume_id, &self.organization_id)
    }
}

fn present(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

impl SubmissionEvent {
    /// Checks required fields without touching any collaborator.
    pub fn validate(&self) -> Result<Submission, ParsingError> {
        let organization_id =
            present(&self.organization_id).ok_or(ParsingError::OrganizationRequired)?;

        let mut missing = Vec::new();
        let job_id = present(&self.job_id);
        let resume_id = present(&self.resume_id);
        let original_filename = present(&self.original_filename);
        let file_ref = present(&self.temp_file_ref);
        if job_id.is_none() {
            missing.push("jobId");
        }
        if resume_id.is_none() {
            missing.push("resumeId");
        }
        if original_filename.is_none() {
            missing.push("originalFilename");
        }
        if file_ref.is_none() {
            missing.push("tempFileRef");
        }

        match (job_id, resume_id, original_filename, file_ref) {
            (Some(job_id), Some(resume_id), Some(original_filename), Some(file_ref)) => {
                Ok(Submission {
                    job_id,
                    resume_id,
                    original_filename,
                    file_ref,
                    organization_id,
                    file_metadata: self.file_metadata.clone(),
                })
            }
            _ => Err(ParsingError::InvalidEventData(format!(
                "missing required fields: {}",
                missing.join(", ")
            ))),
        }
    }
}

/// Error payload shared by the failure and diagnostic events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub message: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl From<&ParsingError> for ErrorDetails {
    fn from(error: &ParsingError) -> Self {
        Self {
            message: error.to_string(),
            name: error.name().to_string(),
            stack: Some(format!("{error:?}")),
        }
    }
}

/// Outbound `analysis.resume.parsed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedEvent {
    pub event_type: String,
    pub job_id: String,
    pub resume_id: String,
    pub resume_dto: SecuredResume,
    pub organization_id: String,
    pub processing_time_ms: u64,
    pub file_hash: String,
    pub security_metadata: SecurityMetadata,
    pub confidence: f64,
    pub parsing_method: String,
    pub timestamp: DateTime<Utc>,
}

impl ParsedEvent {
    pub const EVENT_TYPE: &'static str = "AnalysisResumeParsed";
}

/// Outbound `job.resume.failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEvent {
    pub event_type: String,
    pub job_id: String,
    pub resume_id: String,
    pub error: ErrorDetails,
    pub stage: Stage,
    pub retry_attempt: u32,
    pub timestamp: DateTime<Utc>,
}

impl FailedEvent {
    pub const EVENT_TYPE: &'static str = "JobResumeFailed";

    pub fn new(
        job_id: &str,
        resume_id: &str,
        error: &ParsingError,
        stage: Stage,
        retry_attempt: u32,
    ) -> Self {
        Self {
            event_type: Self::EVENT_TYPE.to_string(),
            job_id: job_id.to_string(),
            resume_id: resume_id.to_string(),
            error: ErrorDetails::from(error),
            stage,
            retry_attempt,
            timestamp: Utc::now(),
        }
    }
}

/// Outbound `resume.processing.error`. Diagnostic only, never terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingErrorEvent {
    pub event_type: String,
    pub job_id: String,
    pub resume_id: String,
    pub error: ErrorDetails,
    pub stage: Stage,
    pub retry_attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub service: String,
}

impl ProcessingErrorEvent {
    pub const EVENT_TYPE: &'static str = "ResumeProcessingError";

    pub fn new(
        job_id: &str,
        resume_id: &str,
        error: &ParsingError,
        stage: Stage,
        retry_attempt: u32,
        service: &str,
    ) -> Self {
        Self {
            event_type: Self::EVENT_TYPE.to_string(),
            job_id: job_id.to_string(),
            resume_id: resume_id.to_string(),
            error: ErrorDetails::from(error),
            stage,
            retry_attempt,
            timestamp: Utc::now(),
            service: service.to_string(),
        }
    }
}
