//! Durable storage abstraction.
//!
//! This module provides:
//! - [`LedgerStore`] - Accounts, the append-only ledger, site activity and shelves
//! - [`SiteRegistry`] - Registered sites and their API credentials
//! - [`LedgerCommit`] - One atomic balance mutation plus its log entry
//! - [`AccountOpening`] - A new account plus its provisioning credits
//! - [`MemoryStore`] - In-memory implementation of both traits
//! - [`FileStore`] - JSON-snapshot backed implementation of both traits
//!
//! # Atomicity
//!
//! [`LedgerStore::commit`] is the only way balances change. It is conditioned
//! on the account's `version`: if another commit landed first the store
//! returns [`StoreError::VersionConflict`] and nothing is written. The
//! balance projection, the ledger entry and an optional chapter unlock are
//! written together or not at all. [`LedgerStore::open_account`] gives the
//! same guarantee for a new account, its welcome entry and the referrer's
//! bonus.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    Account, AccountId, Book, BookId, Email, EntryKind, LedgerEntry, NewBook, ReferralCode,
    ShelfEntry, Site, SiteActivity, SiteId,
};
use crate::secret::Secret;

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Error type for durable store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced record does not exist.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// A unique field already holds this value.
    #[error("duplicate {field}")]
    Conflict { field: &'static str },

    /// The account changed since it was read.
    #[error("account {account} changed concurrently (expected version {expected}, found {found})")]
    VersionConflict {
        account: AccountId,
        expected: u64,
        found: u64,
    },

    /// The storage backend encountered an error.
    #[error("backend error: {message}")]
    Backend { message: String },

    /// I/O error reading or writing the store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The log half of a [`LedgerCommit`]; the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub site_id: Option<SiteId>,
    pub kind: EntryKind,
    pub amount: i64,
    pub description: String,
}

/// A fully computed balance mutation, conditioned on `expected_version`.
#[derive(Debug, Clone)]
pub struct LedgerCommit {
    pub account_id: AccountId,
    pub expected_version: u64,
    pub balance: u64,
    pub lifetime_earned: u64,
    pub lifetime_spent: u64,
    pub entry: NewLedgerEntry,
    /// Increment the unlocked chapter count of this book in the same step.
    pub unlock: Option<BookId>,
    pub at: DateTime<Utc>,
}

/// What a successful [`LedgerStore::commit`] wrote.
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub account: Account,
    pub entry: LedgerEntry,
    pub shelf: Option<ShelfEntry>,
}

/// A new account and the credits granted with it, written in one step.
#[derive(Debug, Clone)]
pub struct AccountOpening {
    /// The account as stored; its counters already include `welcome`.
    pub account: Account,
    /// Entry recording the welcome credit.
    pub welcome: Option<NewLedgerEntry>,
    /// Version-checked credit to the referring account.
    pub referral: Option<LedgerCommit>,
}

impl AccountOpening {
    /// An opening without credits.
    pub fn bare(account: Account) -> Self {
        Self {
            account,
            welcome: None,
            referral: None,
        }
    }
}

/// Versioned on-disk layout shared by the in-memory and file stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Version of the snapshot format (for future migrations).
    pub version: u32,
    pub next_entry_id: u64,
    pub next_book_id: u64,
    pub accounts: Vec<Account>,
    pub entries: Vec<LedgerEntry>,
    pub activity: Vec<SiteActivity>,
    pub sites: Vec<Site>,
    pub books: Vec<Book>,
    pub shelf: Vec<ShelfEntry>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: 1,
            next_entry_id: 1,
            next_book_id: 1,
            accounts: Vec::new(),
            entries: Vec::new(),
            activity: Vec::new(),
            sites: Vec::new(),
            books: Vec::new(),
            shelf: Vec::new(),
        }
    }
}

/// Durable store for accounts and the credit ledger.
///
/// Implementations must make every method atomic with respect to the others;
/// in particular [`commit`](Self::commit) and
/// [`upsert_activity`](Self::upsert_activity) must not admit lost updates.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>, StoreError>;

    async fn find_account_by_email(&self, email: &Email) -> Result<Option<Account>, StoreError>;

    async fn find_account_by_identity(&self, subject: &str)
    -> Result<Option<Account>, StoreError>;

    async fn find_account_by_referral_code(
        &self,
        code: &ReferralCode,
    ) -> Result<Option<Account>, StoreError>;

    /// Insert a new account with no opening credits.
    async fn insert_account(&self, account: Account) -> Result<Account, StoreError> {
        self.open_account(AccountOpening::bare(account)).await
    }

    /// Insert a new account together with its opening entries.
    ///
    /// Fails with [`StoreError::Conflict`] naming the field when the email,
    /// identity subject or referral code is already taken, and with
    /// [`StoreError::VersionConflict`] when the referral commit is stale.
    /// Nothing is written unless everything is.
    async fn open_account(&self, opening: AccountOpening) -> Result<Account, StoreError>;

    /// Attach a federated identity subject to an existing account.
    async fn link_identity(&self, id: &AccountId, subject: &str) -> Result<Account, StoreError>;

    /// Apply a balance mutation and append its entry atomically.
    async fn commit(&self, commit: LedgerCommit) -> Result<CommitReceipt, StoreError>;

    /// All entries of an account in commit order.
    async fn entries_for(&self, id: &AccountId) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Create the (account, site) row with one visit, or bump it.
    async fn upsert_activity(
        &self,
        account: &AccountId,
        site: &SiteId,
        at: DateTime<Utc>,
    ) -> Result<SiteActivity, StoreError>;

    async fn get_activity(
        &self,
        account: &AccountId,
        site: &SiteId,
    ) -> Result<Option<SiteActivity>, StoreError>;

    async fn insert_book(&self, book: NewBook) -> Result<Book, StoreError>;

    async fn get_book(&self, id: BookId) -> Result<Option<Book>, StoreError>;

    /// Catalogue ordered by book id.
    async fn list_books(&self) -> Result<Vec<Book>, StoreError>;

    async fn get_shelf_entry(
        &self,
        account: &AccountId,
        book: BookId,
    ) -> Result<Option<ShelfEntry>, StoreError>;

    /// Shelf rows of an account ordered by book id.
    async fn shelf_for(&self, account: &AccountId) -> Result<Vec<ShelfEntry>, StoreError>;

    /// Set the last chapter read, creating the shelf row if needed.
    ///
    /// Fails with [`StoreError::NotFound`] for an unknown book.
    async fn record_progress(
        &self,
        account: &AccountId,
        book: BookId,
        chapter: u32,
        at: DateTime<Utc>,
    ) -> Result<ShelfEntry, StoreError>;
}

/// Durable set of registered sites.
///
/// Registration, rotation and activation are administrative operations; the
/// request path only reads.
#[async_trait]
pub trait SiteRegistry: Send + Sync {
    async fn find_site_by_api_key(&self, api_key: &str) -> Result<Option<Site>, StoreError>;

    async fn find_site_by_domain(&self, domain: &str) -> Result<Option<Site>, StoreError>;

    async fn get_site(&self, id: &SiteId) -> Result<Option<Site>, StoreError>;

    async fn list_sites(&self) -> Result<Vec<Site>, StoreError>;

    /// Fails with [`StoreError::Conflict`] on a duplicate domain or API key.
    async fn register_site(&self, site: Site) -> Result<Site, StoreError>;

    async fn rotate_api_key(&self, id: &SiteId, api_key: Secret) -> Result<Site, StoreError>;

    async fn set_site_active(&self, id: &SiteId, active: bool) -> Result<Site, StoreError>;
}
