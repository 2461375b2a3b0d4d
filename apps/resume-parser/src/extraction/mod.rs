//! Turns raw file bytes into plain text for the AI adapter.
//!
//! The format is sniffed from the content, never from the filename: `%PDF`
//! goes to the PDF extractor, a ZIP local-file header is treated as DOCX,
//! anything else is decoded as (lossy) UTF-8.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub mod docx;

pub const PDF_MAGIC: &[u8] = b"%PDF";
pub const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Characters forwarded to the AI adapter. Longer documents are cut.
pub const DEFAULT_MAX_TEXT_CHARS: usize = 30_000;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("No text could be extracted from the document")]
    Empty,

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("DOCX extraction failed: {0}")]
    Docx(String),

    #[error("Extraction task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentKind {
    Pdf,
    Docx,
    PlainText,
}

impl DocumentKind {
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.starts_with(PDF_MAGIC) {
            DocumentKind::Pdf
        } else if bytes.starts_with(ZIP_MAGIC) {
            DocumentKind::Docx
        } else {
            DocumentKind::PlainText
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => "pdf",
            DocumentKind::Docx => "docx",
            DocumentKind::PlainText => "plain-text",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedText {
    pub text: String,
    pub kind: DocumentKind,
    pub truncated: bool,
}

/// Byte-level PDF text extraction.
#[async_trait]
pub trait PdfTextExtractor: Send + Sync {
    async fn extract_pdf(&self, bytes: Bytes) -> Result<String, ExtractionError>;
}

/// `pdf-extract` on the blocking pool; parsing is CPU-bound and can take
/// seconds on large scans.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfExtract;

#[async_trait]
impl PdfTextExtractor for PdfExtract {
    async fn extract_pdf(&self, bytes: Bytes) -> Result<String, ExtractionError> {
        tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
            .await
            .map_err(|e| ExtractionError::Task(e.to_string()))?
            .map_err(|e| ExtractionError::Pdf(e.to_string()))
    }
}

#[derive(Clone)]
pub struct TextExtractor {
    pdf: Arc<dyn PdfTextExtractor>,
    max_chars: usize,
}

impl TextExtractor {
    pub fn new(pdf: Arc<dyn PdfTextExtractor>) -> Self {
        Self {
            pdf,
            max_chars: DEFAULT_MAX_TEXT_CHARS,
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    pub async fn extract(&self, bytes: Bytes) -> Result<ExtractedText, ExtractionError> {
        let kind = DocumentKind::sniff(&bytes);
        let raw = match kind {
            DocumentKind::Pdf => self.pdf.extract_pdf(bytes).await?,
            DocumentKind::Docx => {
                tokio::task::spawn_blocking(move || docx::extract_docx_text(&bytes))
                    .await
                    .map_err(|e| ExtractionError::Task(e.to_string()))??
            }
            DocumentKind::PlainText => decode_plain_text(&bytes),
        };

        let normalized = normalize_whitespace(&raw);
        if normalized.is_empty() {
            return Err(ExtractionError::Empty);
        }

        let (text, truncated) = truncate_chars(normalized, self.max_chars);
        debug!(
            kind = kind.as_str(),
            chars = text.chars().count(),
            truncated,
            "Extracted document text"
        );
        Ok(ExtractedText {
            text,
            kind,
            truncated,
        })
    }
}

fn decode_plain_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .collect()
}

/// Collapses horizontal whitespace runs, trims every line and keeps at most
/// one blank line between paragraphs.
fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_run += 1;
            if blank_run > 1 || out.is_empty() {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(&collapsed);
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn truncate_chars(text: String, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => (text[..cut].to_string(), true),
        None => (text, false),
    }
}
