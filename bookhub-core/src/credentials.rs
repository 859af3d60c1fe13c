//! Password credential validation.
//!
//! The hub never stores or compares passwords itself. It asks a
//! [`CredentialValidator`] whether an email/password pair is valid and, for
//! freshly provisioned password accounts, asks it to enroll the password.
//!
//! [`Argon2Credentials`] keeps PHC hashes in memory and, when opened with
//! [`load_from_path`](Argon2Credentials::load_from_path), rewrites them to a
//! JSON file after every enrollment.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::model::Email;

/// Error type for credential operations.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// A password is already enrolled for this email.
    #[error("credential already enrolled for {email}")]
    AlreadyEnrolled { email: String },

    /// Hashing or verification failed inside the backend.
    #[error("credential backend error: {message}")]
    Backend { message: String },

    /// Reading or writing the credential file failed.
    #[error("credential file error: {0}")]
    Io(#[from] std::io::Error),

    /// The credential file is malformed.
    #[error("credential file is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Classify for CredentialError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyEnrolled { .. } => ErrorKind::Conflict,
            Self::Backend { .. } | Self::Io(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }
}

/// Verifies and enrolls password credentials keyed by email.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// Check a password. Returns `Ok(false)` for an unknown email.
    async fn verify(&self, email: &Email, password: &str) -> Result<bool, CredentialError>;

    /// Store a password for an email that has none yet.
    async fn enroll(&self, email: &Email, password: &str) -> Result<(), CredentialError>;
}

/// Argon2id credential store.
///
/// Hashes are PHC strings, so the parameters used at enrollment travel with
/// each hash. Hashing runs on the blocking pool.
pub struct Argon2Credentials {
    hasher: Argon2<'static>,
    hashes: RwLock<HashMap<Email, String>>,
    path: Option<PathBuf>,
}

impl Argon2Credentials {
    /// Create an in-memory store using the default Argon2id parameters.
    pub fn new() -> Self {
        Self {
            hasher: Argon2::default(),
            hashes: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Create an in-memory store with explicit memory (KiB) and iteration costs.
    pub fn with_cost(memory_kib: u32, iterations: u32) -> Result<Self, CredentialError> {
        let params = Params::new(memory_kib, iterations, 1, None).map_err(backend)?;
        Ok(Self {
            hasher: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
            hashes: RwLock::new(HashMap::new()),
            path: None,
        })
    }

    /// Open a file-backed store, creating parent directories as needed.
    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self, CredentialError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let hashes = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            hasher: Argon2::default(),
            hashes: RwLock::new(hashes),
            path: Some(path),
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // Caller holds the write lock.
    fn save(&self, hashes: &HashMap<Email, String>) -> Result<(), CredentialError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents = serde_json::to_string_pretty(hashes)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Number of enrolled credentials.
    pub fn len(&self) -> usize {
        self.hashes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Argon2Credentials {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Argon2Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Argon2Credentials")
            .field("enrolled", &self.len())
            .finish()
    }
}

fn backend(e: impl std::fmt::Display) -> CredentialError {
    CredentialError::Backend {
        message: e.to_string(),
    }
}

#[async_trait]
impl CredentialValidator for Argon2Credentials {
    async fn verify(&self, email: &Email, password: &str) -> Result<bool, CredentialError> {
        let Some(stored) = self.hashes.read().get(email).cloned() else {
            return Ok(false);
        };

        let hasher = self.hasher.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || {
            let parsed = PasswordHash::new(&stored).map_err(backend)?;
            Ok(hasher.verify_password(password.as_bytes(), &parsed).is_ok())
        })
        .await
        .map_err(backend)?
    }

    async fn enroll(&self, email: &Email, password: &str) -> Result<(), CredentialError> {
        if self.hashes.read().contains_key(email) {
            return Err(CredentialError::AlreadyEnrolled {
                email: email.to_string(),
            });
        }

        let hasher = self.hasher.clone();
        let password = password.to_string();
        let hash = tokio::task::spawn_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            hasher
                .hash_password(password.as_bytes(), &salt)
                .map(|h| h.to_string())
                .map_err(backend)
        })
        .await
        .map_err(backend)??;

        {
            let mut hashes = self.hashes.write();
            if hashes.contains_key(email) {
                return Err(CredentialError::AlreadyEnrolled {
                    email: email.to_string(),
                });
            }
            hashes.insert(email.clone(), hash);
            if let Err(e) = self.save(&hashes) {
                hashes.remove(email);
                return Err(e);
            }
        }
        tracing::debug!("Enrolled password credential for {}", email);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> Argon2Credentials {
        Argon2Credentials::with_cost(8, 1).unwrap()
    }

    #[tokio::test]
    async fn test_enroll_and_verify() {
        let creds = fast();
        let email = Email::parse("reader@example.com").unwrap();

        creds.enroll(&email, "correct-horse").await.unwrap();
        assert!(creds.verify(&email, "correct-horse").await.unwrap());
        assert!(!creds.verify(&email, "wrong-horse").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_email_does_not_verify() {
        let creds = fast();
        let email = Email::parse("nobody@example.com").unwrap();
        assert!(!creds.verify(&email, "anything").await.unwrap());
    }

    #[tokio::test]
    async fn test_double_enroll_rejected() {
        let creds = fast();
        let email = Email::parse("twice@example.com").unwrap();
        creds.enroll(&email, "first").await.unwrap();

        let result = creds.enroll(&email, "second").await;
        assert!(matches!(result, Err(CredentialError::AlreadyEnrolled { .. })));
        assert!(creds.verify(&email, "first").await.unwrap());
        assert_eq!(creds.len(), 1);
    }

    #[tokio::test]
    async fn test_file_backed_credentials_survive_reload() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("credentials.json");
        let email = Email::parse("durable@example.com").unwrap();

        {
            let creds = Argon2Credentials::load_from_path(path.clone()).unwrap();
            creds.enroll(&email, "kept").await.unwrap();
        }

        let creds = Argon2Credentials::load_from_path(path).unwrap();
        assert_eq!(creds.len(), 1);
        assert!(creds.verify(&email, "kept").await.unwrap());
    }

    #[tokio::test]
    async fn test_hashes_are_phc_strings() {
        let creds = fast();
        let email = Email::parse("phc@example.com").unwrap();
        creds.enroll(&email, "pw").await.unwrap();
        let stored = creds.hashes.read().get(&email).cloned().unwrap();
        assert!(stored.starts_with("$argon2id$"));
        assert!(!stored.contains("pw$"));
    }
}
