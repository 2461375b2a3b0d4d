use std::collections::HashSet;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrganizationError {
    #[error("Invalid master key: {0}")]
    InvalidMasterKey(String),

    #[error("Organization {0} is not known")]
    UnknownOrganization(String),
}

/// 256-bit data key scoped to one organization.
#[derive(Clone)]
pub struct OrganizationKey {
    pub key_id: String,
    pub bytes: [u8; 32],
}

impl std::fmt::Debug for OrganizationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrganizationKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Source of organization entitlements and keys.
#[async_trait]
pub trait OrganizationDirectory: Send + Sync {
    /// Whether `organization_id` may process résumés for `job_id`.
    async fn can_process_job(
        &self,
        organization_id: &str,
        job_id: &str,
    ) -> Result<bool, OrganizationError>;

    async fn encryption_key(&self, organization_id: &str) -> Result<OrganizationKey, OrganizationError>;
}

/// Directory configured from the environment.
///
/// Keys are derived as SHA-256(master key ‖ organization id). With no
/// allow-list every organization is entitled to every job.
pub struct StaticOrganizationDirectory {
    master_key: [u8; 32],
    allowed: Option<HashSet<String>>,
}

impl StaticOrganizationDirectory {
    pub fn new(master_key: [u8; 32], allowed: Option<HashSet<String>>) -> Self {
        Self { master_key, allowed }
    }

    /// `master_key_hex` must be 64 hex characters.
    pub fn from_hex(
        master_key_hex: &str,
        allowed: Option<HashSet<String>>,
    ) -> Result<Self, OrganizationError> {
        let bytes = hex::decode(master_key_hex.trim())
            .map_err(|e| OrganizationError::InvalidMasterKey(e.to_string()))?;
        let master_key: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            OrganizationError::InvalidMasterKey(format!(
                "Key must be 32 bytes (64 hex chars), got {} bytes",
                b.len()
            ))
        })?;
        Ok(Self::new(master_key, allowed))
    }

    fn is_allowed(&self, organization_id: &str) -> bool {
        self.allowed
            .as_ref()
            .map_or(true, |allowed| allowed.contains(organization_id))
    }

    fn derive(&self, organization_id: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.master_key);
        hasher.update(organization_id.as_bytes());
        hasher.finalize().into()
    }
}

#[async_trait]
impl OrganizationDirectory for StaticOrganizationDirectory {
    async fn can_process_job(
        &self,
        organization_id: &str,
        _job_id: &str,
    ) -> Result<bool, OrganizationError> {
        Ok(self.is_allowed(organization_id))
    }

    async fn encryption_key(&self, organization_id: &str) -> Result<OrganizationKey, OrganizationError> {
        if !self.is_allowed(organization_id) {
            return Err(OrganizationError::UnknownOrganization(organization_id.to_string()));
        }
        let bytes = self.derive(organization_id);
        // Fingerprint of the key, not the key itself.
        let fingerprint = hex::encode(Sha256::digest(bytes));
        Ok(OrganizationKey {
            key_id: format!("{organization_id}:{}", &fingerprint[..16]),
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[tokio::test]
    async fn test_keys_are_per_organization_and_stable() {
        let directory = StaticOrganizationDirectory::from_hex(MASTER, None).unwrap();
        let a1 = directory.encryption_key("org-a").await.unwrap();
        let a2 = directory.encryption_key("org-a").await.unwrap();
        let b = directory.encryption_key("org-b").await.unwrap();
        assert_eq!(a1.bytes, a2.bytes);
        assert_eq!(a1.key_id, a2.key_id);
        assert_ne!(a1.bytes, b.bytes);
        assert!(a1.key_id.starts_with("org-a:"));
    }

    #[tokio::test]
    async fn test_allow_list() {
        let allowed = HashSet::from(["org-1".to_string()]);
        let directory = StaticOrganizationDirectory::from_hex(MASTER, Some(allowed)).unwrap();
        assert!(directory.can_process_job("org-1", "job-1").await.unwrap());
        assert!(!directory.can_process_job("org-2", "job-1").await.unwrap());
        assert!(matches!(
            directory.encryption_key("org-2").await,
            Err(OrganizationError::UnknownOrganization(_))
        ));
    }

    #[test]
    fn test_rejects_bad_master_keys() {
        assert!(StaticOrganizationDirectory::from_hex("abcd", None).is_err());
        assert!(StaticOrganizationDirectory::from_hex(&"zz".repeat(32), None).is_err());
        assert!(StaticOrganizationDirectory::from_hex("abc", None).is_err());

        let Err(OrganizationError::InvalidMasterKey(message)) =
            StaticOrganizationDirectory::from_hex("abcd", None)
        else {
            panic!("short key accepted");
        };
        assert!(message.contains("got 2 bytes"), "{message}");
    }

    #[tokio::test]
    async fn test_master_key_hex_is_case_insensitive() {
        let upper = StaticOrganizationDirectory::from_hex(&MASTER.to_uppercase(), None).unwrap();
        let lower = StaticOrganizationDirectory::from_hex(MASTER, None).unwrap();
        let a = upper.encryption_key("org-a").await.unwrap();
        let b = lower.encryption_key("org-a").await.unwrap();
        assert_eq!(a.bytes, b.bytes);
        assert_eq!(a.key_id, b.key_id);
        assert_eq!(a.key_id.len(), "org-a:".len() + 16);
    }

    #[test]
    fn test_debug_hides_key_material() {
        let key = OrganizationKey {
            key_id: "org-1:abc".into(),
            bytes: [7; 32],
        };
        assert!(!format!("{key:?}").contains("7, 7"));
    }
}
