//! PII encryption under organization-scoped keys.
//!
//! Contact info is serialized to JSON and sealed with AES-256-GCM. The
//! additional authenticated data binds the ciphertext to its
//! `organization:resume` pair, so an envelope moved to another résumé fails
//! to open.

use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::models::resume::{
    CanonicalResume, ContactInfo, EncryptedField, SecuredResume, SecurityMetadata,
};

pub mod organizations;

pub use organizations::{
    OrganizationDirectory, OrganizationError, OrganizationKey, StaticOrganizationDirectory,
};

pub const ALGORITHM: &str = "AES-256-GCM";
pub const ENCRYPTION_VERSION: &str = "1.0";
pub const DATA_CLASSIFICATION: &str = "confidential";
const NONCE_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("Organization {organization_id} is not entitled to process job {job_id}")]
    NotEntitled {
        organization_id: String,
        job_id: String,
    },

    #[error(transparent)]
    Organization(#[from] OrganizationError),

    #[error("Encryption error: {0}")]
    Encrypt(String),

    #[error("Decryption error: {0}")]
    Decrypt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Identifies the résumé being sealed; used for entitlement and AAD.
#[derive(Debug, Clone, Copy)]
pub struct SealContext<'a> {
    pub organization_id: &'a str,
    pub job_id: &'a str,
    pub resume_id: &'a str,
}

impl SealContext<'_> {
    fn aad(&self) -> Vec<u8> {
        format!("{}:{}", self.organization_id, self.resume_id).into_bytes()
    }
}

#[derive(Clone)]
pub struct EncryptionService {
    directory: Arc<dyn OrganizationDirectory>,
    processing_node: String,
}

impl EncryptionService {
    pub fn new(directory: Arc<dyn OrganizationDirectory>, processing_node: impl Into<String>) -> Self {
        Self {
            directory,
            processing_node: processing_node.into(),
        }
    }

    /// Re-checks entitlement, then seals the contact block.
    pub async fn secure(
        &self,
        resume: CanonicalResume,
        ctx: SealContext<'_>,
    ) -> Result<SecuredResume, EncryptionError> {
        if !self
            .directory
            .can_process_job(ctx.organization_id, ctx.job_id)
            .await?
        {
            return Err(EncryptionError::NotEntitled {
                organization_id: ctx.organization_id.to_string(),
                job_id: ctx.job_id.to_string(),
            });
        }

        let key = self.directory.encryption_key(ctx.organization_id).await?;
        let plaintext = serde_json::to_vec(&resume.contact_info)?;
        let contact_info = seal(&key, &plaintext, &ctx.aad())?;
        debug!(key_id = %key.key_id, "Sealed contact info");

        Ok(SecuredResume {
            contact_info,
            skills: resume.skills,
            work_experience: resume.work_experience,
            education: resume.education,
            security_metadata: SecurityMetadata {
                encrypted: true,
                encryption_version: ENCRYPTION_VERSION.to_string(),
                processing_node: self.processing_node.clone(),
                data_classification: DATA_CLASSIFICATION.to_string(),
                encrypted_fields: vec!["contactInfo".to_string()],
                encrypted_at: Utc::now(),
            },
        })
    }

    /// Opens a sealed contact block for a consumer holding the organization key.
    pub async fn decrypt_contact_info(
        &self,
        field: &EncryptedField,
        ctx: SealContext<'_>,
    ) -> Result<ContactInfo, EncryptionError> {
        let key = self.directory.encryption_key(ctx.organization_id).await?;
        if field.key_id != key.key_id {
            return Err(EncryptionError::Decrypt(format!(
                "Envelope sealed with key {} but organization key is {}",
                field.key_id, key.key_id
            )));
        }
        let plaintext = open(&key, field, &ctx.aad())?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

fn seal(key: &OrganizationKey, plaintext: &[u8], aad: &[u8]) -> Result<EncryptedField, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(&key.bytes)
        .map_err(|e| EncryptionError::Encrypt(format!("Failed to create cipher: {e}")))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| EncryptionError::Encrypt(e.to_string()))?;

    Ok(EncryptedField {
        algorithm: ALGORITHM.to_string(),
        key_id: key.key_id.clone(),
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    })
}

fn open(key: &OrganizationKey, field: &EncryptedField, aad: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    if field.algorithm != ALGORITHM {
        return Err(EncryptionError::Decrypt(format!(
            "Unsupported algorithm {}",
            field.algorithm
        )));
    }
    let nonce_bytes = BASE64
        .decode(&field.nonce)
        .map_err(|e| EncryptionError::Decrypt(format!("Invalid nonce: {e}")))?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(EncryptionError::Decrypt("Nonce must be 12 bytes".to_string()));
    }
    let ciphertext = BASE64
        .decode(&field.ciphertext)
        .map_err(|e| EncryptionError::Decrypt(format!("Invalid ciphertext: {e}")))?;

    let cipher = Aes256Gcm::new_from_slice(&key.bytes)
        .map_err(|e| EncryptionError::Decrypt(format!("Failed to create cipher: {e}")))?;
    cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &ciphertext,
                aad,
            },
        )
        .map_err(|e| EncryptionError::Decrypt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    const MASTER: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn service(allowed: Option<&[&str]>) -> EncryptionService {
        let allowed = allowed.map(|orgs| orgs.iter().map(|o| o.to_string()).collect::<HashSet<_>>());
        let directory = StaticOrganizationDirectory::from_hex(MASTER, allowed).unwrap();
        EncryptionService::new(Arc::new(directory), "node-a")
    }

    fn ctx<'a>(org: &'a str, resume: &'a str) -> SealContext<'a> {
        SealContext {
            organization_id: org,
            job_id: "job-1",
            resume_id: resume,
        }
    }

    fn resume() -> CanonicalResume {
        CanonicalResume {
            contact_info: ContactInfo {
                name: Some("Jane Doe".into()),
                email: Some("jane@example.com".into()),
                ..Default::default()
            },
            skills: vec!["Go".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_secure_and_decrypt() {
        let service = service(None);
        let secured = service.secure(resume(), ctx("org-1", "resume-1")).await.unwrap();

        assert_eq!(secured.contact_info.algorithm, ALGORITHM);
        assert!(!secured.contact_info.ciphertext.contains("Jane"));
        assert_eq!(secured.skills, vec!["Go"]);
        assert!(secured.security_metadata.encrypted);
        assert_eq!(secured.security_metadata.processing_node, "node-a");
        assert_eq!(secured.security_metadata.encrypted_fields, vec!["contactInfo"]);

        let contact = service
            .decrypt_contact_info(&secured.contact_info, ctx("org-1", "resume-1"))
            .await
            .unwrap();
        assert_eq!(contact, resume().contact_info);
    }

    #[tokio::test]
    async fn test_nonces_are_fresh() {
        let service = service(None);
        let a = service.secure(resume(), ctx("org-1", "resume-1")).await.unwrap();
        let b = service.secure(resume(), ctx("org-1", "resume-1")).await.unwrap();
        assert_ne!(a.contact_info.nonce, b.contact_info.nonce);
        assert_ne!(a.contact_info.ciphertext, b.contact_info.ciphertext);
    }

    #[tokio::test]
    async fn test_envelope_is_bound_to_resume_and_org() {
        let service = service(None);
        let secured = service.secure(resume(), ctx("org-1", "resume-1")).await.unwrap();

        let moved = service
            .decrypt_contact_info(&secured.contact_info, ctx("org-1", "resume-2"))
            .await;
        assert!(matches!(moved, Err(EncryptionError::Decrypt(_))));

        let other_org = service
            .decrypt_contact_info(&secured.contact_info, ctx("org-2", "resume-1"))
            .await;
        assert!(matches!(other_org, Err(EncryptionError::Decrypt(_))));
    }

    #[tokio::test]
    async fn test_unentitled_organization_is_rejected() {
        let service = service(Some(&["org-1"]));
        let err = service
            .secure(resume(), ctx("org-9", "resume-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EncryptionError::NotEntitled { .. }));
    }
}
