use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{
    content_type_for, sha256_hex, BlobError, BlobMetadata, BlobRef, BlobStore, SHA256_METADATA_KEY,
};

const SCHEME: &str = "s3";
const KEY_PREFIX: &str = "resumes";

/// S3 / MinIO implementation of the blob store.
///
/// `store` writes into the configured bucket; the other operations honour the
/// bucket named in the reference so files staged by other services resolve.
#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

/// Maps SDK failures onto the gateway's taxonomy. 404 is `NotFound`;
/// timeouts, dispatch failures, throttling and 5xx are transient.
fn classify<E>(operation: &str, blob: &BlobRef, err: SdkError<E, HttpResponse>) -> BlobError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let message = format!("S3 {operation} {blob} failed: {}", DisplayErrorContext(&err));

    match (&err, status) {
        (_, Some(404)) => BlobError::NotFound(blob.to_string()),
        (SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_), _) => {
            BlobError::Transient(message)
        }
        (_, Some(429)) | (_, Some(500..=599)) => BlobError::Transient(message),
        _ => BlobError::Storage(message),
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn store(
        &self,
        bytes: Bytes,
        filename: &str,
        mut metadata: HashMap<String, String>,
    ) -> Result<BlobRef, BlobError> {
        let safe_name: String = filename
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
            .collect();
        let blob = BlobRef::new(
            SCHEME,
            &self.bucket,
            &format!("{KEY_PREFIX}/{}-{safe_name}", Uuid::new_v4()),
        );
        metadata
            .entry(SHA256_METADATA_KEY.to_string())
            .or_insert_with(|| sha256_hex(&bytes));

        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&blob.bucket)
            .key(&blob.id)
            .body(ByteStream::from(bytes))
            .content_type(content_type_for(filename))
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| {
                error!("S3 PUT failed for {blob}: {}", DisplayErrorContext(&e));
                classify("PUT", &blob, e)
            })?;

        info!("Stored {size} bytes at {blob}");
        Ok(blob)
    }

    async fn retrieve(&self, blob: &BlobRef) -> Result<Bytes, BlobError> {
        debug!("Retrieving {blob}");
        let output = self
            .client
            .get_object()
            .bucket(&blob.bucket)
            .key(&blob.id)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    BlobError::NotFound(blob.to_string())
                } else {
                    classify("GET", blob, e)
                }
            })?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| BlobError::Transient(format!("Failed to read body of {blob}: {e}")))?;
        Ok(body.into_bytes())
    }

    async fn head(&self, blob: &BlobRef) -> Result<BlobMetadata, BlobError> {
        let output = self
            .client
            .head_object()
            .bucket(&blob.bucket)
            .key(&blob.id)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                    BlobError::NotFound(blob.to_string())
                } else {
                    classify("HEAD", blob, e)
                }
            })?;

        Ok(BlobMetadata {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            content_type: output.content_type().map(str::to_string),
            sha256: output
                .metadata()
                .and_then(|m| m.get(SHA256_METADATA_KEY))
                .cloned(),
        })
    }

    async fn delete(&self, blob: &BlobRef) -> Result<bool, BlobError> {
        // DeleteObject succeeds for missing keys, so existence is checked first.
        match self.head(blob).await {
            Ok(_) => {}
            Err(BlobError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        }

        self.client
            .delete_object()
            .bucket(&blob.bucket)
            .key(&blob.id)
            .send()
            .await
            .map_err(|e| classify("DELETE", blob, e))?;

        info!("Deleted {blob}");
        Ok(true)
    }
}
