//! AI extraction adapter.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::ParsingError;
use crate::llm_client::prompts::{resume_extraction_prompt, JSON_ONLY_SYSTEM};
use crate::llm_client::{LlmClient, LlmError};

/// Untyped key/value output of the extraction service.
pub type RawFields = Map<String, Value>;

/// Sends extracted résumé text to an understanding service.
///
/// Implementations make exactly one attempt per call and either return the
/// full field set or an `AiParsing` error flagged as retryable or not. A
/// partial result is never returned as success.
#[async_trait]
pub trait ResumeExtractor: Send + Sync {
    async fn parse_text(&self, text: &str) -> Result<RawFields, ParsingError>;
}

pub struct LlmResumeExtractor {
    llm: LlmClient,
}

impl LlmResumeExtractor {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }
}

impl From<LlmError> for ParsingError {
    fn from(e: LlmError) -> Self {
        ParsingError::AiParsing {
            retryable: e.is_transient(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl ResumeExtractor for LlmResumeExtractor {
    async fn parse_text(&self, text: &str) -> Result<RawFields, ParsingError> {
        let prompt = resume_extraction_prompt(text);
        let value: Value = self.llm.call_json(&prompt, JSON_ONLY_SYSTEM).await?;
        into_fields(value)
    }
}

fn into_fields(value: Value) -> Result<RawFields, ParsingError> {
    match value {
        Value::Object(fields) => {
            debug!(keys = fields.len(), "AI extraction returned fields");
            Ok(fields)
        }
        other => Err(ParsingError::AiParsing {
            message: format!("AI extraction returned {} instead of an object", kind_of(&other)),
            retryable: false,
        }),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_object_is_accepted() {
        let fields = into_fields(json!({"name": "Jane Doe", "skills": ["Go"]})).unwrap();
        assert_eq!(fields["name"], "Jane Doe");
    }

    #[test]
    fn test_non_object_is_not_retryable() {
        let err = into_fields(json!(["Go"])).unwrap_err();
        assert_eq!(err.name(), "AIParsingFailure");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn test_llm_errors_keep_their_retryability() {
        let throttled: ParsingError = LlmError::RateLimited {
            message: "slow down".into(),
        }
        .into();
        assert!(throttled.is_retryable());

        let rejected: ParsingError = LlmError::Api {
            status: 401,
            message: "invalid x-api-key".into(),
        }
        .into();
        assert!(!rejected.is_retryable());
    }
}
