//! Login resolution: turning credentials into an account.
//!
//! This module provides:
//! - [`AccountResolver`] - Password and federated-identity login flows
//! - [`PasswordLogin`] - Inputs for the password flow
//! - [`Resolution`] - The resolved account plus whether it was just created
//! - [`WelcomeBonuses`] - Credit amounts granted at provisioning
//!
//! Both flows end the same way: an account is found or provisioned, and a
//! visit is recorded for the calling site. Provisioning grants a welcome
//! bonus and, when a referral code resolves to another account, a larger
//! welcome bonus plus a referral bonus for the referrer.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::activity::SiteActivityTracker;
use crate::credentials::{CredentialError, CredentialValidator};
use crate::error::{Classify, ErrorKind};
use crate::identity::IdentityClaims;
use crate::ledger::{CreditLedger, Grant, LedgerError};
use crate::model::{Account, AccountDraft, Email, EntryKind, ReferralCode, Site};
use crate::secret::{Secret, generate_referral_code};
use crate::store::{LedgerStore, StoreError};

/// Attempts at drawing an unused referral code before giving up.
const REFERRAL_CODE_ATTEMPTS: u32 = 5;

/// Attempts at the lookup-or-provision cycle when a concurrent login wins.
const PROVISION_ATTEMPTS: u32 = 2;

/// Error type for login resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Malformed login input.
    #[error("invalid login request: {message}")]
    InvalidRequest { message: String },

    /// Email/password pair rejected. Deliberately says nothing else.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The account matched by email is linked to a different identity.
    #[error("account is linked to a different identity")]
    IdentityConflict,

    /// Error from the credential collaborator.
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Error applying provisioning bonuses.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Error from the underlying store.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl Classify for ResolveError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::InvalidCredentials => ErrorKind::AuthenticationFailure,
            Self::IdentityConflict => ErrorKind::Conflict,
            Self::Credential(e) => e.kind(),
            Self::Ledger(e) => e.kind(),
            Self::Store(e) => e.kind(),
        }
    }
}

/// Credit amounts granted when an account is provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeBonuses {
    /// Welcome bonus without a referral.
    pub welcome: u64,
    /// Welcome bonus when a referral code resolves. Replaces `welcome`.
    pub referral_welcome: u64,
    /// Bonus credited to the referring account.
    pub referrer: u64,
}

impl Default for WelcomeBonuses {
    fn default() -> Self {
        Self {
            welcome: 5,
            referral_welcome: 10,
            referrer: 10,
        }
    }
}

/// Inputs for a password login.
#[derive(Debug, Clone)]
pub struct PasswordLogin {
    pub email: String,
    pub password: Secret,
    pub referral_code: Option<String>,
    pub first_name: String,
    pub last_name: String,
}

impl PasswordLogin {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: Secret::new(password),
            referral_code: None,
            first_name: String::new(),
            last_name: String::new(),
        }
    }

    pub fn with_referral(mut self, code: impl Into<String>) -> Self {
        self.referral_code = Some(code.into());
        self
    }

    pub fn with_names(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = first.into();
        self.last_name = last.into();
        self
    }
}

/// A resolved login.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub account: Account,
    /// Whether the account was provisioned by this login.
    pub is_new: bool,
}

/// Resolves logins to accounts, provisioning new ones as needed.
pub struct AccountResolver {
    store: Arc<dyn LedgerStore>,
    ledger: Arc<CreditLedger>,
    credentials: Arc<dyn CredentialValidator>,
    activity: SiteActivityTracker,
    bonuses: WelcomeBonuses,
}

impl AccountResolver {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        ledger: Arc<CreditLedger>,
        credentials: Arc<dyn CredentialValidator>,
        activity: SiteActivityTracker,
    ) -> Self {
        Self {
            store,
            ledger,
            credentials,
            activity,
            bonuses: WelcomeBonuses::default(),
        }
    }

    pub fn with_bonuses(mut self, bonuses: WelcomeBonuses) -> Self {
        self.bonuses = bonuses;
        self
    }

    /// Resolve an email/password login made through `site`.
    ///
    /// A wrong password and an unusable email both fail with
    /// [`ResolveError::InvalidCredentials`]. An email with neither an account
    /// nor an enrolled password is provisioned and the password enrolled.
    /// Accounts opened by a federated login never accept a password, even
    /// one left enrolled by a login that lost the race to create them.
    pub async fn login_with_password(
        &self,
        site: &Site,
        login: &PasswordLogin,
    ) -> Result<Resolution, ResolveError> {
        let email = Email::parse(&login.email).ok_or_else(|| ResolveError::InvalidRequest {
            message: "email is required".to_string(),
        })?;
        let password = login.password.expose();
        if password.is_empty() {
            return Err(ResolveError::InvalidRequest {
                message: "password is required".to_string(),
            });
        }

        // Passwords are enrolled before their account is inserted, so an
        // account seen here already has its credential in place.
        let existing = self.store.find_account_by_email(&email).await?;
        let verified = self.credentials.verify(&email, password).await?;

        let resolution = match (verified, existing) {
            (true, Some(account)) if account.password_enabled => Resolution {
                account,
                is_new: false,
            },
            (_, Some(_)) => {
                tracing::debug!("Password rejected on site {}", site.domain);
                return Err(ResolveError::InvalidCredentials);
            }
            (verified, None) => {
                if !verified && !self.enroll_or_verify(&email, password).await? {
                    return Err(ResolveError::InvalidCredentials);
                }

                let draft = AccountDraft::new(email.clone())
                    .with_names(login.first_name.trim(), login.last_name.trim())
                    .with_password();
                match self
                    .provision(site, draft, login.referral_code.as_deref())
                    .await
                {
                    Ok(account) => Resolution {
                        account,
                        is_new: true,
                    },
                    // A concurrent login with the same password created the account
                    // first. One created by a federated login is not ours to enter.
                    Err(ResolveError::Store(StoreError::Conflict { field: "email" })) => {
                        match self.store.find_account_by_email(&email).await? {
                            Some(account) if account.password_enabled => Resolution {
                                account,
                                is_new: false,
                            },
                            _ => return Err(ResolveError::InvalidCredentials),
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        self.activity
            .record_visit(&resolution.account.id, &site.id)
            .await;
        Ok(resolution)
    }

    /// Resolve a login backed by verified identity-provider claims.
    ///
    /// Matches by identity subject first, then by email (linking the
    /// subject to that account), and provisions otherwise.
    pub async fn login_with_identity(
        &self,
        site: &Site,
        claims: &IdentityClaims,
        referral_code: Option<&str>,
    ) -> Result<Resolution, ResolveError> {
        if claims.subject.trim().is_empty() {
            return Err(ResolveError::InvalidRequest {
                message: "identity subject is required".to_string(),
            });
        }

        let mut attempt = 0;
        let resolution = loop {
            attempt += 1;
            if let Some(account) = self.store.find_account_by_identity(&claims.subject).await? {
                break Resolution {
                    account,
                    is_new: false,
                };
            }

            if let Some(account) = self.store.find_account_by_email(&claims.email).await? {
                let account = match self.store.link_identity(&account.id, &claims.subject).await {
                    Ok(linked) => linked,
                    Err(StoreError::Conflict { .. }) => {
                        tracing::warn!(
                            "Account {} is already linked to another identity",
                            account.id
                        );
                        return Err(ResolveError::IdentityConflict);
                    }
                    Err(e) => return Err(e.into()),
                };
                tracing::info!("Linked identity to existing account {}", account.id);
                break Resolution {
                    account,
                    is_new: false,
                };
            }

            let draft = AccountDraft::new(claims.email.clone())
                .with_names(claims.first_name.trim(), claims.last_name.trim())
                .with_identity(claims.subject.clone());
            match self.provision(site, draft, referral_code).await {
                Ok(account) => {
                    break Resolution {
                        account,
                        is_new: true,
                    };
                }
                Err(ResolveError::Store(StoreError::Conflict { field }))
                    if attempt < PROVISION_ATTEMPTS
                        && (field == "email" || field == "identity_id") =>
                {
                    tracing::debug!("Lost provisioning race on {}, resolving again", field);
                }
                Err(e) => return Err(e),
            }
        };

        self.activity
            .record_visit(&resolution.account.id, &site.id)
            .await;
        Ok(resolution)
    }

    /// Enrol a first password for `email`.
    ///
    /// When a concurrent login enrolled first, the password is checked
    /// against theirs instead. Returns whether the caller holds the
    /// enrolled password.
    async fn enroll_or_verify(&self, email: &Email, password: &str) -> Result<bool, ResolveError> {
        match self.credentials.enroll(email, password).await {
            Ok(()) => Ok(true),
            Err(CredentialError::AlreadyEnrolled { .. }) => {
                tracing::debug!("Password enrolled concurrently, verifying instead");
                Ok(self.credentials.verify(email, password).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create an account together with its provisioning bonuses.
    async fn provision(
        &self,
        site: &Site,
        draft: AccountDraft,
        referral_code: Option<&str>,
    ) -> Result<Account, ResolveError> {
        let email = draft.email.clone();
        let referrer = self.resolve_referrer(referral_code).await;
        let referral_description = format!("Referral bonus for {}", email);

        let mut attempt = 0;
        let account = loop {
            attempt += 1;
            let mut candidate =
                Account::provision(draft.clone(), ReferralCode::new(generate_referral_code()));
            let referrer = referrer.as_ref().filter(|r| r.id != candidate.id);
            candidate.referred_by = referrer.map(|r| r.id);

            let welcome = match referrer {
                Some(_) => Grant::new(
                    self.bonuses.referral_welcome,
                    "Welcome bonus + referral bonus",
                ),
                None => Grant::new(self.bonuses.welcome, "Welcome bonus"),
            };
            let welcome = Some(welcome).filter(|g| g.amount > 0);
            let referral = referrer
                .filter(|_| self.bonuses.referrer > 0)
                .map(|r| (r.id, Grant::new(self.bonuses.referrer, &referral_description)));

            match self
                .ledger
                .open_account(candidate, Some(&site.id), welcome, referral)
                .await
            {
                Ok(account) => break account,
                Err(LedgerError::Store(StoreError::Conflict {
                    field: "referral_code",
                })) if attempt < REFERRAL_CODE_ATTEMPTS => {
                    tracing::debug!("Referral code collision, drawing another");
                }
                Err(LedgerError::Store(e)) => return Err(e.into()),
                Err(e) => return Err(e.into()),
            }
        };

        tracing::info!(
            "Provisioned account {} via site {}{}",
            account.id,
            site.domain,
            if account.referred_by.is_some() { " (referred)" } else { "" }
        );
        Ok(account)
    }

    /// Look up the account owning a referral code.
    ///
    /// Never fails: an unknown code or a lookup error means no referrer.
    async fn resolve_referrer(&self, code: Option<&str>) -> Option<Account> {
        let code = ReferralCode::new(code?);
        if code.as_str().is_empty() {
            return None;
        }

        match self.store.find_account_by_referral_code(&code).await {
            Ok(Some(account)) => Some(account),
            Ok(None) => {
                tracing::debug!("Referral code {} does not resolve", code);
                None
            }
            Err(e) => {
                tracing::warn!("Referral lookup failed, granting plain welcome bonus: {}", e);
                None
            }
        }
    }
}

impl std::fmt::Debug for AccountResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountResolver")
            .field("bonuses", &self.bonuses)
            .finish_non_exhaustive()
    }
}
