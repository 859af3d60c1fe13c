//! Top-level error types for Bookhub.
//!
//! Every component error classifies into an [`ErrorKind`]. The kind, not the
//! error's `Display` text, is what callers outside the hub get to see.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CodeStoreError;
use crate::credentials::CredentialError;
use crate::handoff::HandoffError;
use crate::identity::IdentityError;
use crate::ledger::LedgerError;
use crate::resolve::ResolveError;
use crate::session::SessionError;
use crate::shelf::ShelfError;
use crate::sites::SiteAuthError;
use crate::store::StoreError;

/// Stable, minimal error classification surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad site credential, bad user credential, or bad/expired token.
    AuthenticationFailure,
    /// Caller is authenticated but not allowed, e.g. handoff site mismatch.
    AuthorizationFailure,
    /// Spend exceeds the current balance.
    InsufficientBalance,
    /// Unknown site, account or resource.
    NotFound,
    /// A unique field or state precondition is violated.
    Conflict,
    /// Malformed input.
    InvalidRequest,
    /// Storage or collaborator failure.
    Internal,
}

impl ErrorKind {
    /// Short machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthenticationFailure => "authentication_failure",
            Self::AuthorizationFailure => "authorization_failure",
            Self::InsufficientBalance => "insufficient_balance",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::InvalidRequest => "invalid_request",
            Self::Internal => "internal",
        }
    }

    /// Message safe to return to any caller.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::AuthenticationFailure => "Authentication failed",
            Self::AuthorizationFailure => "Not permitted for this site",
            Self::InsufficientBalance => "Insufficient credits",
            Self::NotFound => "Not found",
            Self::Conflict => "Request conflicts with current state",
            Self::InvalidRequest => "Invalid request",
            Self::Internal => "Internal error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors that can be reduced to an [`ErrorKind`].
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::VersionConflict { .. }
            | Self::Backend { .. }
            | Self::Io(_)
            | Self::Serialization(_) => ErrorKind::Internal,
        }
    }
}

impl Classify for CodeStoreError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

/// Top-level error type encompassing all Bookhub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// Site credential check failed.
    #[error("site authentication error: {0}")]
    Site(#[from] SiteAuthError),

    /// Session token issuance or validation failed.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Identity-provider token verification failed.
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Password credential collaborator failed.
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Login resolution failed.
    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// Ledger mutation failed.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Cross-site handoff failed.
    #[error("handoff error: {0}")]
    Handoff(#[from] HandoffError),

    /// Shelf read or progress update failed.
    #[error("shelf error: {0}")]
    Shelf(#[from] ShelfError),

    /// Error from the durable store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Malformed input rejected before reaching a component.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl Classify for HubError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Site(e) => e.kind(),
            Self::Session(e) => e.kind(),
            Self::Identity(e) => e.kind(),
            Self::Credential(e) => e.kind(),
            Self::Resolve(e) => e.kind(),
            Self::Ledger(e) => e.kind(),
            Self::Handoff(e) => e.kind(),
            Self::Shelf(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
        }
    }
}

impl HubError {
    /// Convenience for [`Classify::kind`].
    pub fn kind(&self) -> ErrorKind {
        Classify::kind(self)
    }
}
