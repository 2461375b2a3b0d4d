use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    content_type_for, sha256_hex, BlobError, BlobMetadata, BlobRef, BlobStore, SHA256_METADATA_KEY,
};

/// In-process blob store with call counters and scripted retrieval failures.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<BlobRef, (Bytes, BlobMetadata)>>,
    retrieve_failures: Mutex<VecDeque<BlobError>>,
    pub head_calls: AtomicU32,
    pub retrieve_calls: AtomicU32,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places content at an explicit reference, recording its hash.
    pub async fn insert(&self, reference: &str, bytes: impl Into<Bytes>) -> BlobRef {
        let blob: BlobRef = reference.parse().expect("valid test reference");
        let bytes = bytes.into();
        let metadata = BlobMetadata {
            size: bytes.len() as u64,
            content_type: Some(content_type_for(&blob.id).to_string()),
            sha256: Some(sha256_hex(&bytes)),
        };
        self.blobs.lock().await.insert(blob.clone(), (bytes, metadata));
        blob
    }

    /// Overrides the metadata `head` reports, e.g. to fake a huge file.
    pub async fn set_metadata(&self, blob: &BlobRef, metadata: BlobMetadata) {
        if let Some(entry) = self.blobs.lock().await.get_mut(blob) {
            entry.1 = metadata;
        }
    }

    /// The next `retrieve` calls fail with these errors, in order.
    pub async fn fail_retrievals(&self, errors: Vec<BlobError>) {
        self.retrieve_failures.lock().await.extend(errors);
    }

    pub fn retrieve_count(&self) -> u32 {
        self.retrieve_calls.load(Ordering::SeqCst)
    }

    pub fn head_count(&self) -> u32 {
        self.head_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn store(
        &self,
        bytes: Bytes,
        filename: &str,
        metadata: HashMap<String, String>,
    ) -> Result<BlobRef, BlobError> {
        let blob = BlobRef::new("memory", "test", &format!("{}-{}", Uuid::new_v4(), filename));
        let meta = BlobMetadata {
            size: bytes.len() as u64,
            content_type: Some(content_type_for(filename).to_string()),
            sha256: metadata
                .get(SHA256_METADATA_KEY)
                .cloned()
                .or_else(|| Some(sha256_hex(&bytes))),
        };
        self.blobs.lock().await.insert(blob.clone(), (bytes, meta));
        Ok(blob)
    }

    async fn retrieve(&self, blob: &BlobRef) -> Result<Bytes, BlobError> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.retrieve_failures.lock().await.pop_front() {
            return Err(error);
        }
        self.blobs
            .lock()
            .await
            .get(blob)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| BlobError::NotFound(blob.to_string()))
    }

    async fn head(&self, blob: &BlobRef) -> Result<BlobMetadata, BlobError> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        self.blobs
            .lock()
            .await
            .get(blob)
            .map(|(_, meta)| meta.clone())
            .ok_or_else(|| BlobError::NotFound(blob.to_string()))
    }

    async fn delete(&self, blob: &BlobRef) -> Result<bool, BlobError> {
        Ok(self.blobs.lock().await.remove(blob).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_retrieve_delete() {
        let store = MemoryBlobStore::new();
        let blob = store
            .store(Bytes::from_static(b"hello"), "cv.pdf", HashMap::new())
            .await
            .unwrap();
        assert_eq!(store.retrieve(&blob).await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(store.head(&blob).await.unwrap().size, 5);
        assert!(store.verify_integrity(&blob).await.unwrap());
        assert!(store.delete(&blob).await.unwrap());
        assert!(!store.delete(&blob).await.unwrap());
        assert!(matches!(store.retrieve(&blob).await, Err(BlobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_verify_integrity_detects_tampering() {
        let store = MemoryBlobStore::new();
        let blob = store.insert("store://bucket/cv.pdf", &b"original"[..]).await;
        store
            .set_metadata(
                &blob,
                BlobMetadata {
                    size: 8,
                    content_type: None,
                    sha256: Some(sha256_hex(b"different")),
                },
            )
            .await;
        assert!(!store.verify_integrity(&blob).await.unwrap());
    }
}
