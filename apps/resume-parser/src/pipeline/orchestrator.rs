use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::ai::{RawFields, ResumeExtractor};
use crate::errors::{classify_message, FailureClass, ParsingError, Stage};
use crate::extraction::TextExtractor;
use crate::messaging::{publish_json, EventPublisher, SubmissionHandler};
use crate::models::events::{
    FailedEvent, ParsedEvent, ProcessingErrorEvent, Submission, SubmissionEvent, FAILED_SUBJECT,
    PARSED_SUBJECT, PROCESSING_ERROR_SUBJECT,
};
use crate::pipeline::normalizer::normalize;
use crate::registry::{ProcessingLease, ProcessingRegistry, RegistryError, RegistrySweeper};
use crate::resilience::{retry_with_backoff, CircuitBreakers, CircuitError, Retried, RetryPolicy};
use crate::security::{EncryptionService, SealContext};
use crate::storage::{sha256_hex, BlobError, BlobRef, BlobStore};

pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;

const ALLOWED_EXTENSIONS: &[&str] = &["pdf", "doc", "docx"];
const ALLOWED_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];
/// Storage layers often lose the real type; these are not held against a file.
const GENERIC_MIME_TYPES: &[&str] = &["application/octet-stream", "binary/octet-stream"];

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_file_size_bytes: u64,
    pub retry: RetryPolicy,
    /// Breaker guarding the AI adapter.
    pub breaker_name: String,
    /// `service` field of diagnostic events.
    pub service_name: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            retry: RetryPolicy::default(),
            breaker_name: "resume-processing".to_string(),
            service_name: "resume-parser".to_string(),
        }
    }
}

/// External collaborators the pipeline talks to.
#[derive(Clone)]
pub struct Adapters {
    pub blobs: Arc<dyn BlobStore>,
    pub text: TextExtractor,
    pub ai: Arc<dyn ResumeExtractor>,
    pub encryption: EncryptionService,
    pub publisher: Arc<dyn EventPublisher>,
}

#[derive(Debug)]
pub enum ProcessingOutcome {
    Parsed {
        event: Box<ParsedEvent>,
        ai_attempts: u32,
    },
    Failed {
        stage: Stage,
        error: ParsingError,
        retry_attempt: u32,
    },
    /// Another run for the same key was in flight. Nothing was published.
    Duplicate,
}

#[derive(Debug)]
struct StageFailure {
    stage: Stage,
    error: ParsingError,
    attempts: u32,
}

impl StageFailure {
    fn new(stage: Stage, error: ParsingError, attempts: u32) -> Self {
        Self {
            stage,
            error,
            attempts,
        }
    }

    /// For stages that are never retried.
    fn at(stage: Stage) -> impl FnOnce(ParsingError) -> Self {
        move |error| Self::new(stage, error, 0)
    }
}

fn download_error(error: BlobError) -> ParsingError {
    match error {
        BlobError::NotFound(blob) => ParsingError::Download {
            message: format!("File not found: {blob}"),
            transient: false,
        },
        BlobError::InvalidReference(r) => {
            ParsingError::FileValidation(format!("Invalid file reference: {r}"))
        }
        BlobError::Transient(message) => ParsingError::Download {
            message,
            transient: true,
        },
        BlobError::Storage(message) => ParsingError::Download {
            transient: classify_message(&message) == FailureClass::Transient,
            message,
        },
    }
}

fn extension_of(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

fn check_file_type(filename: &str, mime_type: Option<&str>) -> Result<(), ParsingError> {
    let extension = extension_of(filename).unwrap_or_default();
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(ParsingError::FileValidation(format!(
            "Unsupported file type '{filename}'; allowed: {}",
            ALLOWED_EXTENSIONS.join(", ")
        )));
    }
    if let Some(mime) = mime_type {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !essence.is_empty()
            && !ALLOWED_MIME_TYPES.contains(&essence.as_str())
            && !GENERIC_MIME_TYPES.contains(&essence.as_str())
        {
            return Err(ParsingError::FileValidation(format!(
                "Unsupported content type '{mime}'"
            )));
        }
    }
    Ok(())
}

/// End-to-end orchestration of one submission.
pub struct ResumePipeline {
    registry: ProcessingRegistry,
    sweeper: RegistrySweeper,
    breakers: Arc<CircuitBreakers>,
    adapters: Adapters,
    settings: PipelineSettings,
}

impl ResumePipeline {
    pub fn new(
        registry: ProcessingRegistry,
        breakers: Arc<CircuitBreakers>,
        adapters: Adapters,
        settings: PipelineSettings,
    ) -> Self {
        let sweeper = RegistrySweeper::new(registry.clone(), registry.settings().sweep_interval);
        Self {
            registry,
            sweeper,
            breakers,
            adapters,
            settings,
        }
    }

    pub fn registry(&self) -> &ProcessingRegistry {
        &self.registry
    }

    /// Starts the abandoned-record sweep unless it is disabled in settings.
    pub fn start(&self) {
        if self.registry.settings().sweep_enabled {
            self.sweeper.start();
        } else {
            info!("Registry sweep disabled");
        }
    }

    pub async fn stop(&self) {
        self.sweeper.stop().await;
    }

    /// Runs one delivery to completion.
    ///
    /// Returns `Err` only when the registry could not be consulted, in which
    /// case nothing has been published and the delivery should be retried.
    pub async fn process(&self, event: SubmissionEvent) -> Result<ProcessingOutcome, RegistryError> {
        let started = Instant::now();

        let submission = match event.validate() {
            Ok(submission) => submission,
            Err(error) => {
                warn!(
                    job_id = event.job_id.as_deref().unwrap_or_default(),
                    resume_id = event.resume_id.as_deref().unwrap_or_default(),
                    "Rejected submission: {error}"
                );
                let job_id = event.job_id.unwrap_or_default();
                let resume_id = event.resume_id.unwrap_or_default();
                self.publish_diagnostic(&job_id, &resume_id, &error, Stage::Received, 0)
                    .await;
                self.publish_failure(&job_id, &resume_id, &error, Stage::Received, 0)
                    .await;
                return Ok(ProcessingOutcome::Failed {
                    stage: Stage::Received,
                    error,
                    retry_attempt: 0,
                });
            }
        };

        let span = info_span!(
            "resume",
            resume_id = %submission.resume_id,
            organization_id = %submission.organization_id,
            job_id = %submission.job_id,
        );
        self.run(submission, started).instrument(span).await
    }

    async fn run(
        &self,
        submission: Submission,
        started: Instant,
    ) -> Result<ProcessingOutcome, RegistryError> {
        let Some(lease) = self.registry.begin(&submission.key()).await? else {
            info!("Submission already in flight, dropping duplicate");
            return Ok(ProcessingOutcome::Duplicate);
        };
        info!(filename = %submission.original_filename, "Processing résumé");

        let result = self.execute(&submission, &lease, started).await;

        let outcome = match result {
            Ok((event, ai_attempts)) => {
                info!(
                    processing_time_ms = event.processing_time_ms,
                    confidence = event.confidence,
                    "Résumé parsed"
                );
                ProcessingOutcome::Parsed {
                    event: Box::new(event),
                    ai_attempts,
                }
            }
            Err(StageFailure {
                stage,
                error,
                attempts,
            }) => {
                error!(stage = %stage, retry_attempt = attempts, "Résumé processing failed: {error}");
                let (job_id, resume_id) = (&submission.job_id, &submission.resume_id);
                self.publish_diagnostic(job_id, resume_id, &error, stage, attempts)
                    .await;
                self.publish_failure(job_id, resume_id, &error, stage, attempts)
                    .await;
                ProcessingOutcome::Failed {
                    stage,
                    error,
                    retry_attempt: attempts,
                }
            }
        };

        if let Err(e) = self.registry.finish(&lease).await {
            warn!("Failed to release processing record for {}: {e}", lease.key);
        }
        Ok(outcome)
    }

    async fn execute(
        &self,
        submission: &Submission,
        lease: &ProcessingLease,
        started: Instant,
    ) -> Result<(ParsedEvent, u32), StageFailure> {
        let bytes = self.download(submission).await?;
        let file_hash = sha256_hex(&bytes);
        if let Err(e) = self.registry.record_content_hash(lease, &file_hash).await {
            warn!("Failed to record content hash: {e}");
        }

        let extracted = self
            .adapters
            .text
            .extract(bytes)
            .await
            .map_err(|e| ParsingError::Extraction(e.to_string()))
            .map_err(StageFailure::at(Stage::ExtractingText))?;

        let Retried {
            value: raw,
            attempts: ai_attempts,
        } = self.parse_with_ai(submission, lease, &extracted.text).await?;

        let normalized = normalize(&raw).map_err(StageFailure::at(Stage::Normalizing))?;

        let ctx = SealContext {
            organization_id: &submission.organization_id,
            job_id: &submission.job_id,
            resume_id: &submission.resume_id,
        };
        let secured = self
            .adapters
            .encryption
            .secure(normalized.resume, ctx)
            .await
            .map_err(|e| ParsingError::Encryption(e.to_string()))
            .map_err(StageFailure::at(Stage::Encrypting))?;

        let event = ParsedEvent {
            event_type: ParsedEvent::EVENT_TYPE.to_string(),
            job_id: submission.job_id.clone(),
            resume_id: submission.resume_id.clone(),
            security_metadata: secured.security_metadata.clone(),
            resume_dto: secured,
            organization_id: submission.organization_id.clone(),
            processing_time_ms: started.elapsed().as_millis() as u64,
            file_hash,
            confidence: normalized.confidence,
            parsing_method: format!("ai-extraction/{}", extracted.kind.as_str()),
            timestamp: Utc::now(),
        };

        publish_json(self.adapters.publisher.as_ref(), PARSED_SUBJECT, &event)
            .await
            .map_err(|e| ParsingError::Publish(e.to_string()))
            .map_err(StageFailure::at(Stage::Publishing))?;

        Ok((event, ai_attempts))
    }

    /// Validates type and size, then fetches the content. Size is checked
    /// from metadata before any content is transferred.
    async fn download(&self, submission: &Submission) -> Result<Bytes, StageFailure> {
        let stage = Stage::Downloading;
        let too_large = |size: u64| {
            ParsingError::FileValidation(format!(
                "File size {size} bytes exceeds the {} byte limit",
                self.settings.max_file_size_bytes
            ))
        };

        let declared = submission.file_metadata.as_ref();
        check_file_type(
            &submission.original_filename,
            declared.and_then(|m| m.mime_type.as_deref()),
        )
        .map_err(StageFailure::at(stage))?;
        if let Some(size) = declared.and_then(|m| m.size) {
            if size > self.settings.max_file_size_bytes {
                return Err(StageFailure::new(stage, too_large(size), 0));
            }
        }

        let blob = submission
            .file_ref
            .parse::<BlobRef>()
            .map_err(download_error)
            .map_err(StageFailure::at(stage))?;
        let blob = &blob;
        let blobs = self.adapters.blobs.as_ref();

        let head = self
            .with_retry(submission, stage, "blob-head", move |_| async move {
                blobs.head(blob).await.map_err(download_error)
            })
            .await?;
        let metadata = head.value;
        if metadata.size > self.settings.max_file_size_bytes {
            return Err(StageFailure::new(stage, too_large(metadata.size), head.attempts));
        }
        check_file_type(&submission.original_filename, metadata.content_type.as_deref())
            .map_err(|e| StageFailure::new(stage, e, head.attempts))?;

        let retrieved = self
            .with_retry(submission, stage, "blob-retrieve", move |_| async move {
                blobs.retrieve(blob).await.map_err(download_error)
            })
            .await?;
        let bytes = retrieved.value;
        if bytes.len() as u64 > self.settings.max_file_size_bytes {
            return Err(StageFailure::new(
                stage,
                too_large(bytes.len() as u64),
                retrieved.attempts,
            ));
        }

        debug!(size = bytes.len(), attempts = retrieved.attempts, "Downloaded {blob}");
        Ok(bytes)
    }

    /// AI call wrapped as retry(breaker(call)). An open breaker is not
    /// retryable, so it ends the stage immediately.
    async fn parse_with_ai(
        &self,
        submission: &Submission,
        lease: &ProcessingLease,
        text: &str,
    ) -> Result<Retried<RawFields>, StageFailure> {
        let breaker_handle = self.breakers.get(&self.settings.breaker_name);
        let breaker = breaker_handle.as_ref();
        let ai = self.adapters.ai.as_ref();
        let registry = &self.registry;

        self.with_retry(submission, Stage::AIParsing, "ai-parsing", move |attempt| async move {
            if let Err(e) = registry.record_attempts(lease, attempt).await {
                warn!("Failed to record attempt count: {e}");
            }
            breaker
                .call(|| ai.parse_text(text))
                .await
                .map_err(|e| match e {
                    CircuitError::Open { name } => ParsingError::AiParsing {
                        message: format!("Circuit breaker '{name}' is open; AI extraction skipped"),
                        retryable: false,
                    },
                    CircuitError::Inner(e) => e,
                })
        })
        .await
    }

    async fn with_retry<T, Op, Fut>(
        &self,
        submission: &Submission,
        stage: Stage,
        operation_name: &str,
        operation: Op,
    ) -> Result<Retried<T>, StageFailure>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ParsingError>>,
    {
        retry_with_backoff(
            &self.settings.retry,
            operation_name,
            operation,
            |error: &ParsingError, attempt| {
                let event = ProcessingErrorEvent::new(
                    &submission.job_id,
                    &submission.resume_id,
                    error,
                    stage,
                    attempt,
                    &self.settings.service_name,
                );
                async move { self.emit(PROCESSING_ERROR_SUBJECT, &event).await }
            },
        )
        .await
        .map_err(|exhausted| StageFailure::new(stage, exhausted.error, exhausted.attempts))
    }

    async fn publish_diagnostic(
        &self,
        job_id: &str,
        resume_id: &str,
        error: &ParsingError,
        stage: Stage,
        attempts: u32,
    ) {
        let event = ProcessingErrorEvent::new(
            job_id,
            resume_id,
            error,
            stage,
            attempts,
            &self.settings.service_name,
        );
        self.emit(PROCESSING_ERROR_SUBJECT, &event).await;
    }

    async fn publish_failure(
        &self,
        job_id: &str,
        resume_id: &str,
        error: &ParsingError,
        stage: Stage,
        attempts: u32,
    ) {
        let event = FailedEvent::new(job_id, resume_id, error, stage, attempts);
        self.emit(FAILED_SUBJECT, &event).await;
    }

    /// Publishes an event whose own failure must not escalate.
    async fn emit<T: serde::Serialize + Sync>(&self, subject: &str, event: &T) {
        match publish_json(self.adapters.publisher.as_ref(), subject, event).await {
            Ok(()) => debug!("Published {subject}"),
            Err(e) => error!("Failed to publish {subject}: {e}"),
        }
    }
}

#[async_trait]
impl SubmissionHandler for ResumePipeline {
    async fn handle(&self, event: SubmissionEvent) -> anyhow::Result<()> {
        self.process(event).await?;
        Ok(())
    }
}
