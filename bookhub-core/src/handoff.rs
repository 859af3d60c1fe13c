//! Cross-site handoff codes.
//!
//! A signed-in reader on one site can be sent to another site in the
//! network without logging in again. The origin asks the hub to
//! [`issue`](HandoffProtocol::issue) a single-use code bound to the account
//! and the destination site; the reader follows the returned URL; the
//! destination site presents the code back with its own API key and gets
//! the account in exchange.
//!
//! # Code lifecycle
//!
//! A code is either redeemed once or expires. Redemption removes the code
//! with an atomic [`take`](crate::CodeStore::take) before anything else is
//! checked, so a redemption attempt from the wrong site also burns it and
//! two racing redemptions can never both succeed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::activity::SiteActivityTracker;
use crate::cache::{CodeStore, CodeStoreError};
use crate::error::{Classify, ErrorKind};
use crate::model::{Account, AccountId, Site, SiteId, normalize_domain};
use crate::secret::{generate_handoff_code, mask_credential};
use crate::sites::{SiteAuthError, SiteDirectory};
use crate::store::{LedgerStore, StoreError};

/// Default handoff code lifetime.
pub const DEFAULT_HANDOFF_TTL_SECS: u64 = 300;

/// Default redemption path on destination sites.
pub const DEFAULT_REDEMPTION_PATH: &str = "/auth/login";

/// Cache namespace for handoff codes.
const CODE_KEY_PREFIX: &str = "auth_code:";

/// Attempts at drawing a code that is not already live.
const CODE_ATTEMPTS: u32 = 3;

/// Error type for handoff operations.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// Destination domain is not a registered active site.
    #[error("unknown or inactive destination site: {domain}")]
    UnknownSite { domain: String },

    /// The account the code refers to does not exist.
    #[error("account not found: {account}")]
    AccountNotFound { account: AccountId },

    /// The code never existed, expired, or was already redeemed.
    #[error("invalid or expired handoff code")]
    InvalidOrExpiredCode,

    /// The code was issued for a different site than the caller.
    #[error("handoff code was issued for another site")]
    SiteMismatch,

    /// A redemption URL could not be built for the destination.
    #[error("cannot build redemption url for {domain}: {message}")]
    InvalidUrl { domain: String, message: String },

    /// Stored payload could not be encoded or decoded.
    #[error("handoff payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Error from the code store.
    #[error("code store error: {0}")]
    Cache(#[from] CodeStoreError),

    /// Error from the site registry.
    #[error("site registry error: {0}")]
    Site(SiteAuthError),

    /// Error from the durable store.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl From<SiteAuthError> for HandoffError {
    fn from(e: SiteAuthError) -> Self {
        match e {
            SiteAuthError::UnknownSite { domain } => Self::UnknownSite { domain },
            other => Self::Site(other),
        }
    }
}

impl Classify for HandoffError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownSite { .. } | Self::AccountNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidOrExpiredCode => ErrorKind::AuthenticationFailure,
            Self::SiteMismatch => ErrorKind::AuthorizationFailure,
            Self::InvalidUrl { .. } | Self::Payload(_) | Self::Cache(_) => ErrorKind::Internal,
            Self::Site(e) => e.kind(),
            Self::Store(e) => e.kind(),
        }
    }
}

/// Payload stored under a live code.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HandoffGrant {
    account_id: AccountId,
    site_id: SiteId,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// A freshly issued handoff code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedHandoff {
    pub code: String,
    /// Fully qualified redemption URL on the destination site.
    pub auth_url: String,
    pub ttl_seconds: u64,
    pub site_name: String,
    pub site_domain: String,
}

/// One cross-promotion target with its own single-use code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossPromoLink {
    pub site_name: String,
    pub domain: String,
    pub auth_url: String,
}

/// Issues and redeems cross-site handoff codes.
pub struct HandoffProtocol {
    sites: SiteDirectory,
    codes: Arc<dyn CodeStore>,
    store: Arc<dyn LedgerStore>,
    activity: SiteActivityTracker,
    ttl: Duration,
    redemption_path: String,
}

impl HandoffProtocol {
    pub fn new(
        sites: SiteDirectory,
        codes: Arc<dyn CodeStore>,
        store: Arc<dyn LedgerStore>,
        activity: SiteActivityTracker,
    ) -> Self {
        Self {
            sites,
            codes,
            store,
            activity,
            ttl: Duration::from_secs(DEFAULT_HANDOFF_TTL_SECS),
            redemption_path: DEFAULT_REDEMPTION_PATH.to_string(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_redemption_path(mut self, path: impl Into<String>) -> Self {
        self.redemption_path = path.into();
        self
    }

    /// Issue a code that lets `account` sign in on the site at `domain`.
    pub async fn issue(
        &self,
        account: &AccountId,
        domain: &str,
    ) -> Result<IssuedHandoff, HandoffError> {
        let site = self.sites.active_by_domain(domain).await?;
        self.require_account(account).await?;
        self.issue_for_site(account, &site).await
    }

    /// Issue one independent code per active site other than `excluding`.
    pub async fn issue_cross_promo(
        &self,
        account: &AccountId,
        excluding: Option<&str>,
    ) -> Result<Vec<CrossPromoLink>, HandoffError> {
        self.require_account(account).await?;
        let excluding = excluding.map(normalize_domain);

        let mut links = Vec::new();
        for site in self.sites.list_active().await? {
            if excluding.as_deref() == Some(site.domain.as_str()) {
                continue;
            }
            let issued = self.issue_for_site(account, &site).await?;
            links.push(CrossPromoLink {
                site_name: issued.site_name,
                domain: issued.site_domain,
                auth_url: issued.auth_url,
            });
        }
        Ok(links)
    }

    /// Redeem a code presented by `caller`.
    ///
    /// The code is consumed by this call whatever the outcome.
    pub async fn redeem(&self, code: &str, caller: &Site) -> Result<Account, HandoffError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(HandoffError::InvalidOrExpiredCode);
        }

        let Some(payload) = self.codes.take(&code_key(code)).await? else {
            tracing::debug!(
                "Handoff code {} not found for site {}",
                mask_credential(code),
                caller.domain
            );
            return Err(HandoffError::InvalidOrExpiredCode);
        };
        let grant: HandoffGrant = serde_json::from_str(&payload)?;

        if grant.expires_at <= Utc::now() {
            return Err(HandoffError::InvalidOrExpiredCode);
        }
        if grant.site_id != caller.id {
            tracing::warn!(
                "Handoff code {} presented by {} but issued for another site",
                mask_credential(code),
                caller.domain
            );
            return Err(HandoffError::SiteMismatch);
        }

        let account = self
            .store
            .get_account(&grant.account_id)
            .await?
            .ok_or(HandoffError::AccountNotFound {
                account: grant.account_id,
            })?;

        self.activity.record_visit(&account.id, &caller.id).await;
        tracing::info!(
            "Account {} handed off to site {}",
            account.id,
            caller.domain
        );
        Ok(account)
    }

    async fn require_account(&self, account: &AccountId) -> Result<(), HandoffError> {
        match self.store.get_account(account).await? {
            Some(_) => Ok(()),
            None => Err(HandoffError::AccountNotFound { account: *account }),
        }
    }

    async fn issue_for_site(
        &self,
        account: &AccountId,
        site: &Site,
    ) -> Result<IssuedHandoff, HandoffError> {
        let mut code = generate_handoff_code();
        for _ in 1..CODE_ATTEMPTS {
            if !self.codes.contains(&code_key(&code)).await? {
                break;
            }
            code = generate_handoff_code();
        }

        let auth_url = self.redemption_url(&site.domain, &code)?;
        let issued_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).map_err(|e| HandoffError::InvalidUrl {
            domain: site.domain.clone(),
            message: e.to_string(),
        })?;
        let grant = HandoffGrant {
            account_id: *account,
            site_id: site.id,
            issued_at,
            expires_at: issued_at + ttl,
        };

        self.codes
            .put(&code_key(&code), serde_json::to_string(&grant)?, self.ttl)
            .await?;

        tracing::info!(
            "Issued handoff code {} for account {} to {}",
            mask_credential(&code),
            account,
            site.domain
        );

        Ok(IssuedHandoff {
            code,
            auth_url,
            ttl_seconds: self.ttl.as_secs(),
            site_name: site.name.clone(),
            site_domain: site.domain.clone(),
        })
    }

    fn redemption_url(&self, domain: &str, code: &str) -> Result<String, HandoffError> {
        let invalid = |message: String| HandoffError::InvalidUrl {
            domain: domain.to_string(),
            message,
        };

        let mut url = Url::parse(&format!("https://{}", domain)).map_err(|e| invalid(e.to_string()))?;
        if url.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }
        url.set_path(&self.redemption_path);
        url.query_pairs_mut().append_pair("code", code);
        Ok(url.to_string())
    }
}

impl std::fmt::Debug for HandoffProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffProtocol")
            .field("ttl", &self.ttl)
            .field("redemption_path", &self.redemption_path)
            .finish_non_exhaustive()
    }
}

fn code_key(code: &str) -> String {
    format!("{}{}", CODE_KEY_PREFIX, code)
}
