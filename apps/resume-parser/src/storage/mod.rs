//! Blob store gateway.
//!
//! Files are addressed by opaque references of the form `scheme://bucket/id`.
//! Integrity is SHA-256 of the exact bytes, recorded as `sha256` metadata at
//! store time and compared on `verify_integrity`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[cfg(test)]
pub mod memory;
pub mod s3;

pub use s3::S3BlobStore;

pub const SHA256_METADATA_KEY: &str = "sha256";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobRef {
    pub scheme: String,
    pub bucket: String,
    pub id: String,
}

impl BlobRef {
    pub fn new(scheme: &str, bucket: &str, id: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            id: id.to_string(),
        }
    }
}

impl FromStr for BlobRef {
    type Err = BlobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BlobError::InvalidReference(s.to_string());
        let (scheme, rest) = s.split_once("://").ok_or_else(invalid)?;
        let (bucket, id) = rest.split_once('/').ok_or_else(invalid)?;
        if scheme.is_empty() || bucket.is_empty() || id.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(scheme, bucket, id))
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.id)
    }
}

/// What the store knows about a blob without fetching its content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlobMetadata {
    pub size: u64,
    pub content_type: Option<String>,
    pub sha256: Option<String>,
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob reference: {0}")]
    InvalidReference(String),

    /// Network, timeout, throttling or 5xx. Worth retrying.
    #[error("Transient storage error: {0}")]
    Transient(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl BlobError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BlobError::Transient(_))
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` and returns the reference to hand downstream.
    async fn store(
        &self,
        bytes: Bytes,
        filename: &str,
        metadata: HashMap<String, String>,
    ) -> Result<BlobRef, BlobError>;

    async fn retrieve(&self, blob: &BlobRef) -> Result<Bytes, BlobError>;

    /// Size and metadata only; must not transfer the content.
    async fn head(&self, blob: &BlobRef) -> Result<BlobMetadata, BlobError>;

    /// Returns `false` when there was nothing to delete.
    async fn delete(&self, blob: &BlobRef) -> Result<bool, BlobError>;

    /// Re-hashes the stored content and compares it with the recorded hash.
    /// Blobs stored without a hash cannot be verified and report `false`.
    async fn verify_integrity(&self, blob: &BlobRef) -> Result<bool, BlobError> {
        let Some(expected) = self.head(blob).await?.sha256 else {
            return Ok(false);
        };
        let content = self.retrieve(blob).await?;
        Ok(sha256_hex(&content).eq_ignore_ascii_case(&expected))
    }
}

/// Best-effort content type from a filename extension.
pub fn content_type_for(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_blob_ref() {
        let blob: BlobRef = "store://bucket/abc".parse().unwrap();
        assert_eq!(blob, BlobRef::new("store", "bucket", "abc"));
        assert_eq!(blob.to_string(), "store://bucket/abc");

        let nested: BlobRef = "s3://uploads/tmp/2024/cv.pdf".parse().unwrap();
        assert_eq!(nested.bucket, "uploads");
        assert_eq!(nested.id, "tmp/2024/cv.pdf");
    }

    #[test]
    fn test_reject_malformed_refs() {
        for bad in ["", "bucket/abc", "s3://bucket", "s3:///abc", "://bucket/abc", "s3://bucket/"] {
            assert!(
                matches!(bad.parse::<BlobRef>(), Err(BlobError::InvalidReference(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("CV.PDF"), "application/pdf");
        assert_eq!(content_type_for("resume.docx"), content_type_for("x.DOCX"));
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }
}
