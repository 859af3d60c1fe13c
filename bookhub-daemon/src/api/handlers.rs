//! JSON-RPC API handlers for the daemon.

use super::types::{
    AccessTokenRequest, BooksResponse, CrossPromoRequest, CrossPromoResponse,
    FederatedLoginRequest, IssueHandoffRequest, LedgerHistoryResponse, PasswordLoginRequest,
    RecordProgressRequest, RedeemHandoffRequest, ShelfResponse, UnlockChapterRequest,
    UpdateCreditsRequest,
};
use crate::config::DaemonConfig;
use anyhow::{Context, Result};
use bookhub_core::secret::{generate_signing_secret, mask_credential};
use bookhub_core::{
    AccountView, Argon2Credentials, BookId, ChapterUnlock, Collaborators, CreditUpdate, EntryKind,
    ErrorKind, FileStore, Hub, HubError, IdentityProvider, IssuedHandoff, JwtIdentityProvider,
    JwtSessionIssuer, LedgerError, LoginResponse, MemoryCodeStore, PasswordLogin, Secret,
    ShelfItem, StaticIdentityProvider,
};
use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::{ErrorCode, ErrorObject};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Site or user credential rejected.
pub const AUTHENTICATION_FAILURE_CODE: i32 = -32001;
/// Authenticated, but not allowed.
pub const AUTHORIZATION_FAILURE_CODE: i32 = -32002;
/// Spend exceeds the balance; `data.balance` carries the current balance.
pub const INSUFFICIENT_BALANCE_CODE: i32 = -32003;
pub const NOT_FOUND_CODE: i32 = -32004;
pub const CONFLICT_CODE: i32 = -32005;

/// State shared across RPC handlers.
pub struct ApiState {
    pub hub: Arc<Hub>,
}

impl ApiState {
    /// Build the hub from daemon configuration, then seed sites and books.
    pub async fn from_config(config: &DaemonConfig) -> Result<Self> {
        let ledger_path = config.ledger_path();
        let store = Arc::new(
            FileStore::load_from_path(ledger_path.clone())
                .with_context(|| format!("Failed to load ledger from {:?}", ledger_path))?,
        );

        let credentials_path = config.credentials_path();
        let credentials = Argon2Credentials::load_from_path(credentials_path.clone())
            .with_context(|| format!("Failed to load credentials from {:?}", credentials_path))?;

        let session_secret = match &config.session.secret {
            Some(secret) => Secret::new(secret.clone()),
            None => {
                warn!("No session secret configured; sessions will not survive a restart");
                generate_signing_secret()
            }
        };
        let sessions = JwtSessionIssuer::new(&session_secret, config.session.issuer.clone())
            .with_ttls(config.session.access_ttl_secs, config.session.refresh_ttl_secs);

        let identity = identity_provider(config)?;

        let hub = Hub::new(
            Collaborators {
                store: store.clone(),
                sites: store,
                codes: Arc::new(MemoryCodeStore::new()),
                credentials: Arc::new(credentials),
                sessions: Arc::new(sessions),
                identity,
            },
            config.hub.clone(),
        );

        let state = Self::with_hub(Arc::new(hub));
        state.seed(config).await?;
        Ok(state)
    }

    /// Create API state around an existing hub (useful for tests).
    pub fn with_hub(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    async fn seed(&self, config: &DaemonConfig) -> Result<()> {
        for seed in &config.sites {
            let known = self
                .hub
                .sites()
                .find_by_domain(&seed.domain)
                .await
                .with_context(|| format!("Failed to look up site {}", seed.domain))?;
            if known.is_some() {
                debug!("Site {} already registered", seed.domain);
                continue;
            }

            match &seed.api_key {
                Some(key) => {
                    self.hub
                        .sites()
                        .register_with_key(&seed.name, &seed.domain, Secret::new(key.clone()))
                        .await
                        .with_context(|| format!("Failed to register site {}", seed.domain))?;
                }
                None => {
                    let (site, key) = self
                        .hub
                        .register_site(&seed.name, &seed.domain)
                        .await
                        .with_context(|| format!("Failed to register site {}", seed.domain))?;
                    // Only chance to see a generated key; it never reaches the log.
                    println!("API key for {}: {}", site.domain, key.expose());
                }
            }
        }

        if config.books.is_empty() {
            return Ok(());
        }
        let existing = self.hub.books().await.context("Failed to list books")?;
        for book in &config.books {
            if existing.iter().any(|b| b.title == book.title) {
                continue;
            }
            let book = self
                .hub
                .add_book(book.clone())
                .await
                .with_context(|| format!("Failed to add book {:?}", book.title))?;
            info!("Added book {} ({:?})", book.id, book.title);
        }

        Ok(())
    }
}

fn identity_provider(config: &DaemonConfig) -> Result<Arc<dyn IdentityProvider>> {
    let Some(identity) = &config.identity else {
        warn!("No identity provider configured; federated logins will be rejected");
        return Ok(Arc::new(StaticIdentityProvider::new()));
    };

    if let Some(secret) = &identity.hs256_secret {
        return Ok(Arc::new(JwtIdentityProvider::hs256(
            secret.as_bytes(),
            &identity.issuer,
            &identity.audience,
        )));
    }

    let pem_path = identity
        .rs256_public_key_pem
        .as_ref()
        .context("Identity provider needs hs256_secret or rs256_public_key_pem")?;
    let pem = std::fs::read(pem_path)
        .with_context(|| format!("Failed to read identity key from {:?}", pem_path))?;
    let provider = JwtIdentityProvider::rs256_pem(&pem, &identity.issuer, &identity.audience)
        .with_context(|| format!("Invalid identity key in {:?}", pem_path))?;
    Ok(Arc::new(provider))
}

/// JSON-RPC API trait definition.
#[rpc(server)]
pub trait BookhubApi {
    /// Log in with email and password, creating the account on first use.
    #[method(name = "password_login")]
    async fn password_login(&self, request: PasswordLoginRequest) -> RpcResult<LoginResponse>;

    /// Log in with an identity-provider token.
    #[method(name = "federated_login")]
    async fn federated_login(&self, request: FederatedLoginRequest) -> RpcResult<LoginResponse>;

    /// Apply a credit mutation for the session's account.
    #[method(name = "update_credits")]
    async fn update_credits(&self, request: UpdateCreditsRequest) -> RpcResult<CreditUpdate>;

    /// Spend credits on the next paid chapter of a book.
    #[method(name = "unlock_chapter")]
    async fn unlock_chapter(&self, request: UnlockChapterRequest) -> RpcResult<ChapterUnlock>;

    /// Issue a single-use code for another site.
    #[method(name = "issue_handoff")]
    async fn issue_handoff(&self, request: IssueHandoffRequest) -> RpcResult<IssuedHandoff>;

    /// Redeem a handoff code on the site it was issued for.
    #[method(name = "redeem_handoff")]
    async fn redeem_handoff(&self, request: RedeemHandoffRequest) -> RpcResult<LoginResponse>;

    /// One redemption link per other active site.
    #[method(name = "cross_promo")]
    async fn cross_promo(&self, request: CrossPromoRequest) -> RpcResult<CrossPromoResponse>;

    #[method(name = "profile")]
    async fn profile(&self, request: AccessTokenRequest) -> RpcResult<AccountView>;

    #[method(name = "ledger_history")]
    async fn ledger_history(&self, request: AccessTokenRequest) -> RpcResult<LedgerHistoryResponse>;

    /// The book catalogue.
    #[method(name = "books")]
    async fn books(&self) -> RpcResult<BooksResponse>;

    /// The account's reading shelf.
    #[method(name = "shelf")]
    async fn shelf(&self, request: AccessTokenRequest) -> RpcResult<ShelfResponse>;

    #[method(name = "record_progress")]
    async fn record_progress(&self, request: RecordProgressRequest) -> RpcResult<ShelfItem>;
}

/// Implementation of the Bookhub API.
pub struct BookhubApiImpl {
    state: ApiState,
}

impl BookhubApiImpl {
    /// Create a new API implementation with the given state.
    pub fn new(state: ApiState) -> Self {
        Self { state }
    }
}

#[async_trait::async_trait]
impl BookhubApiServer for BookhubApiImpl {
    async fn password_login(&self, request: PasswordLoginRequest) -> RpcResult<LoginResponse> {
        debug!("RPC: password_login(site {})", mask_credential(&request.api_key));

        let mut login = PasswordLogin::new(request.email, request.password);
        if let Some(code) = request.referral_code {
            login = login.with_referral(code);
        }
        if request.first_name.is_some() || request.last_name.is_some() {
            login = login.with_names(
                request.first_name.unwrap_or_default(),
                request.last_name.unwrap_or_default(),
            );
        }

        self.state
            .hub
            .password_login(&request.api_key, &login)
            .await
            .map_err(rpc_error)
    }

    async fn federated_login(&self, request: FederatedLoginRequest) -> RpcResult<LoginResponse> {
        debug!("RPC: federated_login(site {})", mask_credential(&request.api_key));

        self.state
            .hub
            .federated_login(
                &request.api_key,
                &request.identity_token,
                request.referral_code.as_deref(),
            )
            .await
            .map_err(rpc_error)
    }

    async fn update_credits(&self, request: UpdateCreditsRequest) -> RpcResult<CreditUpdate> {
        debug!("RPC: update_credits({} {})", request.kind, request.amount);

        let kind: EntryKind = request.kind.parse().map_err(|e| {
            ErrorObject::owned(
                ErrorCode::InvalidParams.code(),
                format!("{}", e),
                Some(serde_json::json!({ "kind": ErrorKind::InvalidRequest.code() })),
            )
        })?;

        self.state
            .hub
            .update_credits(
                &request.api_key,
                &request.access_token,
                kind,
                request.amount,
                &request.description,
            )
            .await
            .map_err(rpc_error)
    }

    async fn unlock_chapter(&self, request: UnlockChapterRequest) -> RpcResult<ChapterUnlock> {
        debug!("RPC: unlock_chapter(book {})", request.book_id);

        self.state
            .hub
            .unlock_chapter(&request.access_token, BookId(request.book_id))
            .await
            .map_err(rpc_error)
    }

    async fn issue_handoff(&self, request: IssueHandoffRequest) -> RpcResult<IssuedHandoff> {
        debug!("RPC: issue_handoff({})", request.domain);

        self.state
            .hub
            .issue_handoff(&request.access_token, &request.domain)
            .await
            .map_err(rpc_error)
    }

    async fn redeem_handoff(&self, request: RedeemHandoffRequest) -> RpcResult<LoginResponse> {
        debug!(
            "RPC: redeem_handoff({} at site {})",
            mask_credential(&request.code),
            mask_credential(&request.api_key)
        );

        self.state
            .hub
            .redeem_handoff(&request.api_key, &request.code)
            .await
            .map_err(rpc_error)
    }

    async fn cross_promo(&self, request: CrossPromoRequest) -> RpcResult<CrossPromoResponse> {
        debug!("RPC: cross_promo(excluding {:?})", request.exclude_domain);

        let links = self
            .state
            .hub
            .cross_promo(&request.access_token, request.exclude_domain.as_deref())
            .await
            .map_err(rpc_error)?;
        Ok(CrossPromoResponse { links })
    }

    async fn profile(&self, request: AccessTokenRequest) -> RpcResult<AccountView> {
        debug!("RPC: profile");

        self.state
            .hub
            .profile(&request.access_token)
            .await
            .map_err(rpc_error)
    }

    async fn ledger_history(&self, request: AccessTokenRequest) -> RpcResult<LedgerHistoryResponse> {
        debug!("RPC: ledger_history");

        let entries = self
            .state
            .hub
            .ledger_history(&request.access_token)
            .await
            .map_err(rpc_error)?;
        Ok(LedgerHistoryResponse { entries })
    }

    async fn books(&self) -> RpcResult<BooksResponse> {
        debug!("RPC: books");

        let books = self.state.hub.books().await.map_err(rpc_error)?;
        Ok(BooksResponse { books })
    }

    async fn shelf(&self, request: AccessTokenRequest) -> RpcResult<ShelfResponse> {
        debug!("RPC: shelf");

        let items = self
            .state
            .hub
            .shelf(&request.access_token)
            .await
            .map_err(rpc_error)?;
        Ok(ShelfResponse { items })
    }

    async fn record_progress(&self, request: RecordProgressRequest) -> RpcResult<ShelfItem> {
        debug!(
            "RPC: record_progress(book {}, chapter {})",
            request.book_id, request.chapter
        );

        self.state
            .hub
            .record_progress(
                &request.access_token,
                BookId(request.book_id),
                request.chapter,
            )
            .await
            .map_err(rpc_error)
    }
}

/// Reduce a hub error to its wire form.
///
/// Only the error's kind crosses the socket; the `Display` text of the
/// underlying error has already been logged by the hub when it matters.
pub fn rpc_error(err: HubError) -> ErrorObject<'static> {
    let kind = err.kind();
    let code = match kind {
        ErrorKind::AuthenticationFailure => AUTHENTICATION_FAILURE_CODE,
        ErrorKind::AuthorizationFailure => AUTHORIZATION_FAILURE_CODE,
        ErrorKind::InsufficientBalance => INSUFFICIENT_BALANCE_CODE,
        ErrorKind::NotFound => NOT_FOUND_CODE,
        ErrorKind::Conflict => CONFLICT_CODE,
        ErrorKind::InvalidRequest => ErrorCode::InvalidParams.code(),
        ErrorKind::Internal => ErrorCode::InternalError.code(),
    };

    let data = match &err {
        HubError::Ledger(LedgerError::InsufficientBalance { balance, .. }) => {
            serde_json::json!({ "kind": kind.code(), "balance": balance })
        }
        _ => serde_json::json!({ "kind": kind.code() }),
    };

    ErrorObject::owned(code, kind.public_message(), Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookhub_core::{SiteAuthError, StoreError};

    #[test]
    fn test_insufficient_balance_carries_balance() {
        let err = rpc_error(HubError::Ledger(LedgerError::InsufficientBalance {
            balance: 4,
            requested: 6,
        }));

        assert_eq!(err.code(), INSUFFICIENT_BALANCE_CODE);
        assert_eq!(err.message(), "Insufficient credits");
        let data: serde_json::Value =
            serde_json::from_str(err.data().map(|d| d.get()).unwrap()).unwrap();
        assert_eq!(data["balance"], 4);
        assert_eq!(data["kind"], "insufficient_balance");
    }

    #[test]
    fn test_internal_errors_are_opaque() {
        let err = rpc_error(HubError::Store(StoreError::Backend {
            message: "connection refused to 10.0.0.7".into(),
        }));

        assert_eq!(err.code(), ErrorCode::InternalError.code());
        assert_eq!(err.message(), "Internal error");
        assert!(!err.data().map(|d| d.get()).unwrap().contains("10.0.0.7"));
    }

    #[test]
    fn test_bad_site_key_is_authentication_failure() {
        let err = rpc_error(HubError::Site(SiteAuthError::InvalidCredential));
        assert_eq!(err.code(), AUTHENTICATION_FAILURE_CODE);
    }
}
