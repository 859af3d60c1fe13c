//! The hub facade.
//!
//! [`Hub`] wires the components together and exposes the inbound operations
//! sites call: logins, credit updates, chapter unlocks, reading progress,
//! handoffs and account reads. Every operation authenticates its caller first, either a site by
//! API key or an account by session access token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::activity::SiteActivityTracker;
use crate::cache::CodeStore;
use crate::config::HubSettings;
use crate::credentials::CredentialValidator;
use crate::error::{ErrorKind, HubError};
use crate::handoff::{CrossPromoLink, HandoffProtocol, IssuedHandoff};
use crate::identity::IdentityProvider;
use crate::ledger::{ChapterUnlock, CreditLedger};
use crate::model::{
    Account, AccountId, Book, BookId, EntryId, EntryKind, LedgerEntry, NewBook, Site,
};
use crate::resolve::{AccountResolver, PasswordLogin, Resolution};
use crate::secret::Secret;
use crate::session::{SessionIssuer, SessionTokens};
use crate::shelf::{Bookshelf, ShelfItem};
use crate::sites::SiteDirectory;
use crate::store::{LedgerStore, SiteRegistry};

/// External collaborators a [`Hub`] runs on.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn LedgerStore>,
    pub sites: Arc<dyn SiteRegistry>,
    pub codes: Arc<dyn CodeStore>,
    pub credentials: Arc<dyn CredentialValidator>,
    pub sessions: Arc<dyn SessionIssuer>,
    pub identity: Arc<dyn IdentityProvider>,
}

/// Account snapshot returned to sites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountView {
    pub id: AccountId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub credits: u64,
    pub lifetime_earned: u64,
    pub lifetime_spent: u64,
    pub referral_code: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Account> for AccountView {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id,
            email: account.email.to_string(),
            first_name: account.first_name.clone(),
            last_name: account.last_name.clone(),
            credits: account.balance,
            lifetime_earned: account.lifetime_earned,
            lifetime_spent: account.lifetime_spent,
            referral_code: account.referral_code.to_string(),
            created_at: account.created_at,
        }
    }
}

/// Result of a login or handoff redemption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub tokens: SessionTokens,
    pub account: AccountView,
    pub is_new: bool,
}

/// Result of a credit update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditUpdate {
    pub balance: u64,
    pub transaction_id: EntryId,
}

/// Federated identity and credit hub.
pub struct Hub {
    settings: HubSettings,
    store: Arc<dyn LedgerStore>,
    sites: SiteDirectory,
    ledger: Arc<CreditLedger>,
    resolver: AccountResolver,
    handoff: HandoffProtocol,
    activity: SiteActivityTracker,
    shelf: Bookshelf,
    sessions: Arc<dyn SessionIssuer>,
    identity: Arc<dyn IdentityProvider>,
}

impl Hub {
    pub fn new(collaborators: Collaborators, settings: HubSettings) -> Self {
        let Collaborators {
            store,
            sites,
            codes,
            credentials,
            sessions,
            identity,
        } = collaborators;

        let sites = SiteDirectory::new(sites);
        let activity = SiteActivityTracker::new(store.clone());
        let ledger = Arc::new(CreditLedger::with_max_attempts(
            store.clone(),
            settings.max_commit_attempts,
        ));
        let resolver = AccountResolver::new(
            store.clone(),
            ledger.clone(),
            credentials,
            activity.clone(),
        )
        .with_bonuses(settings.bonuses());
        let handoff = HandoffProtocol::new(sites.clone(), codes, store.clone(), activity.clone())
            .with_ttl(settings.handoff_ttl())
            .with_redemption_path(settings.redemption_path.clone());
        let shelf = Bookshelf::new(store.clone());

        Self {
            settings,
            store,
            sites,
            ledger,
            resolver,
            handoff,
            activity,
            shelf,
            sessions,
            identity,
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Site lookups and administration.
    pub fn sites(&self) -> &SiteDirectory {
        &self.sites
    }

    pub fn activity(&self) -> &SiteActivityTracker {
        &self.activity
    }

    /// Email/password login through the site owning `api_key`.
    pub async fn password_login(
        &self,
        api_key: &str,
        login: &PasswordLogin,
    ) -> Result<LoginResponse, HubError> {
        observe("password_login", async {
            let site = self.sites.authenticate(api_key).await?;
            let resolution = self.resolver.login_with_password(&site, login).await?;
            self.respond(resolution).await
        })
        .await
    }

    /// Federated login with an identity-provider token.
    pub async fn federated_login(
        &self,
        api_key: &str,
        identity_token: &str,
        referral_code: Option<&str>,
    ) -> Result<LoginResponse, HubError> {
        observe("federated_login", async {
            let site = self.sites.authenticate(api_key).await?;
            let claims = self.identity.verify_token(identity_token).await?;
            let resolution = self
                .resolver
                .login_with_identity(&site, &claims, referral_code)
                .await?;
            self.respond(resolution).await
        })
        .await
    }

    /// Apply a credit mutation on behalf of a site for an authenticated account.
    pub async fn update_credits(
        &self,
        api_key: &str,
        access_token: &str,
        kind: EntryKind,
        amount: u64,
        description: &str,
    ) -> Result<CreditUpdate, HubError> {
        observe("update_credits", async {
            let site = self.sites.authenticate(api_key).await?;
            let account = self.sessions.authenticate(access_token).await?;
            let receipt = self
                .ledger
                .apply(&account, Some(&site.id), kind, amount, description.trim())
                .await?;
            Ok::<_, HubError>(CreditUpdate {
                balance: receipt.balance,
                transaction_id: receipt.entry_id,
            })
        })
        .await
    }

    /// Spend credits to unlock the next chapter of a book.
    pub async fn unlock_chapter(
        &self,
        access_token: &str,
        book: BookId,
    ) -> Result<ChapterUnlock, HubError> {
        observe("unlock_chapter", async {
            let account = self.sessions.authenticate(access_token).await?;
            Ok::<_, HubError>(self.ledger.unlock_chapter(&account, book).await?)
        })
        .await
    }

    /// The authenticated account's shelf.
    pub async fn shelf(&self, access_token: &str) -> Result<Vec<ShelfItem>, HubError> {
        observe("shelf", async {
            let account = self.sessions.authenticate(access_token).await?;
            Ok::<_, HubError>(self.shelf.list(&account).await?)
        })
        .await
    }

    /// Record how far the authenticated account has read in a book.
    pub async fn record_progress(
        &self,
        access_token: &str,
        book: BookId,
        chapter: u32,
    ) -> Result<ShelfItem, HubError> {
        observe("record_progress", async {
            let account = self.sessions.authenticate(access_token).await?;
            Ok::<_, HubError>(self.shelf.record_progress(&account, book, chapter).await?)
        })
        .await
    }

    /// Issue a handoff code to the site at `domain`.
    pub async fn issue_handoff(
        &self,
        access_token: &str,
        domain: &str,
    ) -> Result<IssuedHandoff, HubError> {
        observe("issue_handoff", async {
            let account = self.sessions.authenticate(access_token).await?;
            Ok::<_, HubError>(self.handoff.issue(&account, domain).await?)
        })
        .await
    }

    /// Redeem a handoff code for the site owning `api_key`.
    pub async fn redeem_handoff(&self, api_key: &str, code: &str) -> Result<LoginResponse, HubError> {
        observe("redeem_handoff", async {
            let site = self.sites.authenticate(api_key).await?;
            let account = self.handoff.redeem(code, &site).await?;
            self.respond(Resolution {
                account,
                is_new: false,
            })
            .await
        })
        .await
    }

    /// One redemption link per active site except `excluding`.
    pub async fn cross_promo(
        &self,
        access_token: &str,
        excluding: Option<&str>,
    ) -> Result<Vec<CrossPromoLink>, HubError> {
        observe("cross_promo", async {
            let account = self.sessions.authenticate(access_token).await?;
            Ok::<_, HubError>(self.handoff.issue_cross_promo(&account, excluding).await?)
        })
        .await
    }

    /// The authenticated account's snapshot.
    pub async fn profile(&self, access_token: &str) -> Result<AccountView, HubError> {
        observe("profile", async {
            let account = self.sessions.authenticate(access_token).await?;
            let account = self.load_account(&account).await?;
            Ok::<_, HubError>(AccountView::from(&account))
        })
        .await
    }

    /// The authenticated account's ledger entries, newest first.
    pub async fn ledger_history(&self, access_token: &str) -> Result<Vec<LedgerEntry>, HubError> {
        observe("ledger_history", async {
            let account = self.sessions.authenticate(access_token).await?;
            Ok::<_, HubError>(self.ledger.history(&account).await?)
        })
        .await
    }

    /// Register a site and return its one-time API key.
    pub async fn register_site(&self, name: &str, domain: &str) -> Result<(Site, Secret), HubError> {
        Ok(self.sites.register(name, domain).await?)
    }

    /// The book catalogue.
    pub async fn books(&self) -> Result<Vec<Book>, HubError> {
        Ok(self.store.list_books().await?)
    }

    /// Add a book to the catalogue.
    pub async fn add_book(&self, book: NewBook) -> Result<Book, HubError> {
        if book.title.trim().is_empty() {
            return Err(HubError::InvalidRequest {
                message: "book title is required".to_string(),
            });
        }
        Ok(self.store.insert_book(book).await?)
    }

    async fn respond(&self, resolution: Resolution) -> Result<LoginResponse, HubError> {
        let tokens = self.sessions.issue_session(&resolution.account.id).await?;
        Ok(LoginResponse {
            tokens,
            account: AccountView::from(&resolution.account),
            is_new: resolution.is_new,
        })
    }

    async fn load_account(&self, id: &AccountId) -> Result<Account, HubError> {
        self.store.get_account(id).await?.ok_or_else(|| {
            HubError::Store(crate::store::StoreError::NotFound {
                entity: "account",
                key: id.to_string(),
            })
        })
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Log internal failures in full before they are reduced to an [`ErrorKind`].
async fn observe<T>(
    operation: &str,
    fut: impl std::future::Future<Output = Result<T, HubError>>,
) -> Result<T, HubError> {
    let result = fut.await;
    if let Err(e) = &result {
        match e.kind() {
            ErrorKind::Internal => tracing::error!("{} failed: {}", operation, e),
            kind => tracing::debug!("{} rejected ({}): {}", operation, kind, e),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCodeStore;
    use crate::credentials::Argon2Credentials;
    use crate::identity::{IdentityClaims, StaticIdentityProvider};
    use crate::model::Email;
    use crate::session::JwtSessionIssuer;
    use crate::store::MemoryStore;

    async fn hub() -> (Hub, Secret) {
        let store = Arc::new(MemoryStore::new());
        let identity = StaticIdentityProvider::new();
        identity.insert(
            "id-token",
            IdentityClaims::new("g-1", Email::parse("fed@example.com").unwrap()),
        );
        let hub = Hub::new(
            Collaborators {
                store: store.clone(),
                sites: store,
                codes: Arc::new(MemoryCodeStore::new()),
                credentials: Arc::new(Argon2Credentials::with_cost(8, 1).unwrap()),
                sessions: Arc::new(JwtSessionIssuer::new(
                    &Secret::new("hub-test-session-secret-0123456789"),
                    "bookhub",
                )),
                identity: Arc::new(identity),
            },
            HubSettings::default(),
        );
        let (_, key) = hub.register_site("Inkwell", "inkwell.example").await.unwrap();
        (hub, key)
    }

    #[tokio::test]
    async fn test_login_then_spend() {
        let (hub, key) = hub().await;
        let login = hub
            .password_login(key.expose(), &PasswordLogin::new("reader@example.com", "pw"))
            .await
            .unwrap();
        assert!(login.is_new);
        assert_eq!(login.account.credits, 5);

        let token = login.tokens.access_token.expose();
        let update = hub
            .update_credits(key.expose(), token, EntryKind::Spent, 2, "Chapter 3")
            .await
            .unwrap();
        assert_eq!(update.balance, 3);

        let history = hub.ledger_history(token).await.unwrap();
        assert_eq!(history[0].id, update.transaction_id);
        assert_eq!(hub.profile(token).await.unwrap().credits, 3);
    }

    #[tokio::test]
    async fn test_bad_site_key() {
        let (hub, _) = hub().await;
        let err = hub
            .password_login("sk_wrong", &PasswordLogin::new("reader@example.com", "pw"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
    }

    #[tokio::test]
    async fn test_bad_access_token() {
        let (hub, key) = hub().await;
        let err = hub
            .update_credits(key.expose(), "garbage", EntryKind::Earned, 1, "x")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
    }

    #[tokio::test]
    async fn test_federated_login() {
        let (hub, key) = hub().await;
        let first = hub.federated_login(key.expose(), "id-token", None).await.unwrap();
        assert!(first.is_new);
        let second = hub.federated_login(key.expose(), "id-token", None).await.unwrap();
        assert!(!second.is_new);
        assert_eq!(first.account.id, second.account.id);

        let err = hub
            .federated_login(key.expose(), "forged", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
    }

    #[tokio::test]
    async fn test_handoff_round_trip() {
        let (hub, origin_key) = hub().await;
        let (_, dest_key) = hub.register_site("Folio", "folio.example").await.unwrap();

        let login = hub
            .password_login(origin_key.expose(), &PasswordLogin::new("hop@example.com", "pw"))
            .await
            .unwrap();
        let issued = hub
            .issue_handoff(login.tokens.access_token.expose(), "folio.example")
            .await
            .unwrap();

        let redeemed = hub
            .redeem_handoff(dest_key.expose(), &issued.code)
            .await
            .unwrap();
        assert_eq!(redeemed.account.id, login.account.id);
        assert!(!redeemed.is_new);

        let folio = hub
            .sites()
            .active_by_domain("folio.example")
            .await
            .unwrap();
        let visits = hub
            .activity()
            .visits(&login.account.id, &folio.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(visits.visits, 1);
    }

    #[tokio::test]
    async fn test_unlock_chapter() {
        let (hub, key) = hub().await;
        let book = hub
            .add_book(NewBook {
                title: "Salt and Vellum".into(),
                available_chapters: 4,
                free_chapters: 1,
                chapter_credit_cost: 2,
            })
            .await
            .unwrap();
        let login = hub
            .password_login(key.expose(), &PasswordLogin::new("shelf@example.com", "pw"))
            .await
            .unwrap();

        let unlock = hub
            .unlock_chapter(login.tokens.access_token.expose(), book.id)
            .await
            .unwrap();
        assert_eq!(unlock.unlocked_chapters, 1);
        assert_eq!(unlock.remaining_balance, 3);

        let missing = hub
            .unlock_chapter(login.tokens.access_token.expose(), BookId(404))
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_reading_progress_on_shelf() {
        let (hub, key) = hub().await;
        let book = hub
            .add_book(NewBook {
                title: "Harbor of Pages".into(),
                available_chapters: 5,
                free_chapters: 2,
                chapter_credit_cost: 1,
            })
            .await
            .unwrap();
        let login = hub
            .password_login(key.expose(), &PasswordLogin::new("progress@example.com", "pw"))
            .await
            .unwrap();
        let token = login.tokens.access_token.expose();
        assert!(hub.shelf(token).await.unwrap().is_empty());

        let item = hub.record_progress(token, book.id, 2).await.unwrap();
        assert_eq!(item.last_chapter_read, 2);

        let locked = hub.record_progress(token, book.id, 3).await.unwrap_err();
        assert_eq!(locked.kind(), ErrorKind::Conflict);

        hub.unlock_chapter(token, book.id).await.unwrap();
        hub.record_progress(token, book.id, 3).await.unwrap();

        let shelf = hub.shelf(token).await.unwrap();
        assert_eq!(shelf.len(), 1);
        assert_eq!(shelf[0].unlocked_chapters, 1);
        assert_eq!(shelf[0].last_chapter_read, 3);
        assert_eq!(shelf[0].progress_percent, 60.0);

        let err = hub.shelf("garbage").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
    }

    #[tokio::test]
    async fn test_books_listed_in_id_order() {
        let (hub, _) = hub().await;
        for title in ["First Light", "Second Wind"] {
            hub.add_book(NewBook {
                title: title.into(),
                available_chapters: 3,
                free_chapters: 0,
                chapter_credit_cost: 1,
            })
            .await
            .unwrap();
        }

        let books = hub.books().await.unwrap();
        let titles: Vec<&str> = books.iter().map(|b| b.title.as_str()).collect();
        assert_eq!(titles, ["First Light", "Second Wind"]);

        let blank = hub
            .add_book(NewBook {
                title: "  ".into(),
                available_chapters: 1,
                free_chapters: 0,
                chapter_credit_cost: 1,
            })
            .await
            .unwrap_err();
        assert_eq!(blank.kind(), ErrorKind::InvalidRequest);
    }
}
