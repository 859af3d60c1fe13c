//! Session token issuance.
//!
//! After a login or handoff redemption the hub asks a [`SessionIssuer`] for a
//! short-lived access token and a longer-lived refresh token. Sites present
//! the access token back on account-scoped calls.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{Classify, ErrorKind};
use crate::model::AccountId;
use crate::secret::Secret;

/// Default access token lifetime.
pub const DEFAULT_ACCESS_TTL_SECS: u64 = 5 * 60;

/// Default refresh token lifetime.
pub const DEFAULT_REFRESH_TTL_SECS: u64 = 24 * 60 * 60;

/// Error type for session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The token is malformed, expired, or signed by someone else.
    #[error("invalid session token: {reason}")]
    InvalidToken { reason: String },

    /// A refresh token was presented where an access token is required.
    #[error("wrong session token type: expected {expected}")]
    WrongTokenType { expected: &'static str },

    /// Signing failed.
    #[error("failed to sign session token: {message}")]
    Signing { message: String },
}

impl Classify for SessionError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidToken { .. } | Self::WrongTokenType { .. } => {
                ErrorKind::AuthenticationFailure
            }
            Self::Signing { .. } => ErrorKind::Internal,
        }
    }
}

/// Tokens returned to a site after authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTokens {
    pub access_token: Secret,
    pub refresh_token: Secret,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
}

/// Mints and checks session tokens.
#[async_trait]
pub trait SessionIssuer: Send + Sync {
    async fn issue_session(&self, account: &AccountId) -> Result<SessionTokens, SessionError>;

    /// Resolve an access token to the account it was issued for.
    async fn authenticate(&self, access_token: &str) -> Result<AccountId, SessionError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    iss: String,
    iat: i64,
    exp: i64,
    jti: String,
    token_type: String,
}

const ACCESS: &str = "access";
const REFRESH: &str = "refresh";

/// HS256 JWT session issuer.
pub struct JwtSessionIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    access_ttl_secs: u64,
    refresh_ttl_secs: u64,
}

impl JwtSessionIssuer {
    pub fn new(secret: &Secret, issuer: impl Into<String>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.expose().as_bytes()),
            decoding: DecodingKey::from_secret(secret.expose().as_bytes()),
            issuer: issuer.into(),
            access_ttl_secs: DEFAULT_ACCESS_TTL_SECS,
            refresh_ttl_secs: DEFAULT_REFRESH_TTL_SECS,
        }
    }

    pub fn with_ttls(mut self, access_ttl_secs: u64, refresh_ttl_secs: u64) -> Self {
        self.access_ttl_secs = access_ttl_secs;
        self.refresh_ttl_secs = refresh_ttl_secs;
        self
    }

    fn sign(&self, account: &AccountId, token_type: &str, ttl: u64) -> Result<Secret, SessionError> {
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            sub: account.to_string(),
            iss: self.issuer.clone(),
            iat: now,
            exp: now.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX)),
            jti: Uuid::new_v4().to_string(),
            token_type: token_type.to_string(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map(Secret::new)
            .map_err(|e| SessionError::Signing {
                message: e.to_string(),
            })
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.leeway = 0;
        validation
    }
}

impl std::fmt::Debug for JwtSessionIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSessionIssuer")
            .field("issuer", &self.issuer)
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionIssuer for JwtSessionIssuer {
    async fn issue_session(&self, account: &AccountId) -> Result<SessionTokens, SessionError> {
        Ok(SessionTokens {
            access_token: self.sign(account, ACCESS, self.access_ttl_secs)?,
            refresh_token: self.sign(account, REFRESH, self.refresh_ttl_secs)?,
            token_type: "Bearer".to_string(),
            expires_in: self.access_ttl_secs,
        })
    }

    async fn authenticate(&self, access_token: &str) -> Result<AccountId, SessionError> {
        let data = decode::<SessionClaims>(access_token, &self.decoding, &self.validation())
            .map_err(|e| SessionError::InvalidToken {
                reason: e.to_string(),
            })?;

        if data.claims.token_type != ACCESS {
            return Err(SessionError::WrongTokenType { expected: ACCESS });
        }

        AccountId::parse(&data.claims.sub).ok_or_else(|| SessionError::InvalidToken {
            reason: "subject is not an account id".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> JwtSessionIssuer {
        JwtSessionIssuer::new(&Secret::new("session-test-secret-0123456789abcdef"), "bookhub")
    }

    #[tokio::test]
    async fn test_issue_and_authenticate() {
        let issuer = issuer();
        let account = AccountId::new();

        let tokens = issuer.issue_session(&account).await.unwrap();
        assert_eq!(tokens.token_type, "Bearer");
        assert_eq!(tokens.expires_in, DEFAULT_ACCESS_TTL_SECS);
        assert_ne!(tokens.access_token, tokens.refresh_token);

        let resolved = issuer
            .authenticate(tokens.access_token.expose())
            .await
            .unwrap();
        assert_eq!(resolved, account);
    }

    #[tokio::test]
    async fn test_refresh_token_is_not_an_access_token() {
        let issuer = issuer();
        let tokens = issuer.issue_session(&AccountId::new()).await.unwrap();

        let result = issuer.authenticate(tokens.refresh_token.expose()).await;
        assert!(matches!(result, Err(SessionError::WrongTokenType { .. })));
    }

    #[tokio::test]
    async fn test_foreign_signature_rejected() {
        let tokens = issuer().issue_session(&AccountId::new()).await.unwrap();
        let other = JwtSessionIssuer::new(&Secret::new("a-completely-different-secret-value"), "bookhub");

        let err = other
            .authenticate(tokens.access_token.expose())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
    }

    #[tokio::test]
    async fn test_garbage_rejected() {
        assert!(issuer().authenticate("not.a.jwt").await.is_err());
    }
}
