//! Federated identity token verification.
//!
//! This module provides:
//! - [`IdentityProvider`] - Trait for turning a provider token into verified claims
//! - [`JwtIdentityProvider`] - Verifies provider-signed JWTs (HS256 or RS256)
//! - [`StaticIdentityProvider`] - Fixed token table for tests and local development

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::model::Email;

/// Error type for identity verification.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Signature, expiry, issuer or audience check failed.
    #[error("invalid identity token: {reason}")]
    InvalidToken { reason: String },

    /// The token carries no usable email.
    #[error("identity token has no valid email")]
    MissingEmail,

    /// The provider reports the email as unverified.
    #[error("identity email is not verified")]
    UnverifiedEmail,

    /// The verifier itself is misconfigured.
    #[error("identity provider configuration error: {message}")]
    Configuration { message: String },
}

impl Classify for IdentityError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Internal,
            _ => ErrorKind::AuthenticationFailure,
        }
    }
}

/// Verified claims about a federated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Provider-assigned stable subject id.
    pub subject: String,
    pub email: Email,
    pub first_name: String,
    pub last_name: String,
}

impl IdentityClaims {
    pub fn new(subject: impl Into<String>, email: Email) -> Self {
        Self {
            subject: subject.into(),
            email,
            first_name: String::new(),
            last_name: String::new(),
        }
    }

    pub fn with_names(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = first.into();
        self.last_name = last.into();
        self
    }
}

/// Verifies identity-provider tokens.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify_token(&self, token: &str) -> Result<IdentityClaims, IdentityError>;
}

/// Claim set read from a provider JWT.
#[derive(Debug, Deserialize)]
struct ProviderClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<bool>,
    #[serde(default)]
    given_name: Option<String>,
    #[serde(default)]
    family_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl ProviderClaims {
    fn into_identity(self) -> Result<IdentityClaims, IdentityError> {
        if self.email_verified == Some(false) {
            return Err(IdentityError::UnverifiedEmail);
        }
        let email = self
            .email
            .as_deref()
            .and_then(Email::parse)
            .ok_or(IdentityError::MissingEmail)?;

        // Fall back to splitting the display name when the split fields are absent.
        let (first, last) = match (self.given_name, self.family_name) {
            (Some(first), Some(last)) => (first, last),
            (first, last) => {
                let name = self.name.unwrap_or_default();
                let (name_first, name_last) = name.split_once(' ').unwrap_or((name.as_str(), ""));
                (
                    first.unwrap_or_else(|| name_first.to_string()),
                    last.unwrap_or_else(|| name_last.to_string()),
                )
            }
        };

        Ok(IdentityClaims::new(self.sub, email).with_names(first, last))
    }
}

/// JWT verifier for an external identity provider.
pub struct JwtIdentityProvider {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityProvider {
    /// Verify HS256 tokens signed with a shared secret.
    pub fn hs256(secret: &[u8], issuer: &str, audience: &str) -> Self {
        Self::build(DecodingKey::from_secret(secret), Algorithm::HS256, issuer, audience)
    }

    /// Verify RS256 tokens against the provider's PEM-encoded public key.
    pub fn rs256_pem(pem: &[u8], issuer: &str, audience: &str) -> Result<Self, IdentityError> {
        let key = DecodingKey::from_rsa_pem(pem).map_err(|e| IdentityError::Configuration {
            message: e.to_string(),
        })?;
        Ok(Self::build(key, Algorithm::RS256, issuer, audience))
    }

    fn build(key: DecodingKey, algorithm: Algorithm, issuer: &str, audience: &str) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);
        Self { key, validation }
    }
}

impl std::fmt::Debug for JwtIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtIdentityProvider")
            .field("algorithms", &self.validation.algorithms)
            .field("issuer", &self.validation.iss)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn verify_token(&self, token: &str) -> Result<IdentityClaims, IdentityError> {
        let data = decode::<ProviderClaims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!("Identity token rejected: {}", e);
            IdentityError::InvalidToken {
                reason: e.to_string(),
            }
        })?;
        data.claims.into_identity()
    }
}

/// Identity provider backed by a fixed token table.
#[derive(Debug, Default)]
pub struct StaticIdentityProvider {
    tokens: RwLock<HashMap<String, IdentityClaims>>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as proof of `claims`.
    pub fn insert(&self, token: impl Into<String>, claims: IdentityClaims) {
        self.tokens.write().insert(token.into(), claims);
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn verify_token(&self, token: &str) -> Result<IdentityClaims, IdentityError> {
        self.tokens
            .read()
            .get(token)
            .cloned()
            .ok_or_else(|| IdentityError::InvalidToken {
                reason: "unknown token".to_string(),
            })
    }
}
