//! In-memory store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{
    AccountOpening, CommitReceipt, LedgerCommit, LedgerStore, NewLedgerEntry, SiteRegistry,
    Snapshot, StoreError,
};
use crate::model::{
    Account, AccountId, Book, BookId, Email, EntryId, LedgerEntry, NewBook, ReferralCode,
    ShelfEntry, Site, SiteActivity, SiteId, normalize_domain,
};
use crate::secret::Secret;

/// In-memory store for tests, development, and as the working set of [`FileStore`](super::FileStore).
///
/// This store is not persistent; data is lost when the process exits.
///
/// # Thread Safety
///
/// All tables sit behind a single `parking_lot::RwLock`. Every trait method
/// takes the lock once, does its map work synchronously and releases it
/// before returning, so no lock is ever held across an `.await`.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

#[derive(Clone)]
struct Tables {
    next_entry_id: u64,
    next_book_id: u64,
    accounts: HashMap<AccountId, Account>,
    entries: Vec<LedgerEntry>,
    activity: HashMap<(AccountId, SiteId), SiteActivity>,
    sites: HashMap<SiteId, Site>,
    books: HashMap<BookId, Book>,
    shelf: HashMap<(AccountId, BookId), ShelfEntry>,
}

impl Tables {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            next_entry_id: snapshot.next_entry_id,
            next_book_id: snapshot.next_book_id,
            accounts: snapshot.accounts.into_iter().map(|a| (a.id, a)).collect(),
            entries: snapshot.entries,
            activity: snapshot
                .activity
                .into_iter()
                .map(|a| ((a.account_id, a.site_id), a))
                .collect(),
            sites: snapshot.sites.into_iter().map(|s| (s.id, s)).collect(),
            books: snapshot.books.into_iter().map(|b| (b.id, b)).collect(),
            shelf: snapshot
                .shelf
                .into_iter()
                .map(|s| ((s.account_id, s.book_id), s))
                .collect(),
        }
    }

    fn check_new_account(&self, account: &Account) -> Result<(), StoreError> {
        for existing in self.accounts.values() {
            if existing.id == account.id {
                return Err(StoreError::Conflict { field: "id" });
            }
            if existing.email == account.email {
                return Err(StoreError::Conflict { field: "email" });
            }
            if existing.referral_code == account.referral_code {
                return Err(StoreError::Conflict {
                    field: "referral_code",
                });
            }
            if account.identity_id.is_some() && existing.identity_id == account.identity_id {
                return Err(StoreError::Conflict {
                    field: "identity_id",
                });
            }
        }
        Ok(())
    }

    fn check_commit(&self, commit: &LedgerCommit) -> Result<(), StoreError> {
        let current = self
            .accounts
            .get(&commit.account_id)
            .ok_or_else(|| account_not_found(&commit.account_id))?;
        if current.version != commit.expected_version {
            return Err(StoreError::VersionConflict {
                account: commit.account_id,
                expected: commit.expected_version,
                found: current.version,
            });
        }

        if let Some(book_id) = commit.unlock {
            let book = self.books.get(&book_id).ok_or(StoreError::NotFound {
                entity: "book",
                key: book_id.to_string(),
            })?;
            let unlocked = self
                .shelf
                .get(&(commit.account_id, book_id))
                .map(|s| s.unlocked_chapters)
                .unwrap_or(0);
            if unlocked >= book.paid_chapters() {
                return Err(StoreError::Conflict {
                    field: "unlocked_chapters",
                });
            }
        }
        Ok(())
    }

    /// Write a commit already accepted by [`check_commit`](Self::check_commit).
    fn apply_commit(&mut self, commit: LedgerCommit) -> Result<CommitReceipt, StoreError> {
        let account = self
            .accounts
            .get_mut(&commit.account_id)
            .ok_or_else(|| account_not_found(&commit.account_id))?;
        account.balance = commit.balance;
        account.lifetime_earned = commit.lifetime_earned;
        account.lifetime_spent = commit.lifetime_spent;
        account.version += 1;
        account.last_active = commit.at;
        let account = account.clone();

        let entry = self.push_entry(commit.account_id, commit.entry, commit.at);

        let shelf = commit.unlock.map(|book_id| {
            let row = self
                .shelf
                .entry((commit.account_id, book_id))
                .or_insert_with(|| ShelfEntry::new(commit.account_id, book_id, commit.at));
            row.unlocked_chapters += 1;
            row.updated_at = commit.at;
            row.clone()
        });

        Ok(CommitReceipt {
            account,
            entry,
            shelf,
        })
    }

    fn push_entry(
        &mut self,
        account_id: AccountId,
        entry: NewLedgerEntry,
        at: DateTime<Utc>,
    ) -> LedgerEntry {
        let entry = LedgerEntry {
            id: EntryId(self.next_entry_id),
            account_id,
            site_id: entry.site_id,
            kind: entry.kind,
            amount: entry.amount,
            description: entry.description,
            created_at: at,
        };
        self.next_entry_id += 1;
        self.entries.push(entry.clone());
        entry
    }

    fn to_snapshot(&self) -> Snapshot {
        let mut accounts: Vec<Account> = self.accounts.values().cloned().collect();
        accounts.sort_by_key(|a| a.created_at);
        let mut books: Vec<Book> = self.books.values().cloned().collect();
        books.sort_by_key(|b| b.id);

        Snapshot {
            next_entry_id: self.next_entry_id,
            next_book_id: self.next_book_id,
            accounts,
            entries: self.entries.clone(),
            activity: self.activity.values().cloned().collect(),
            sites: self.sites.values().cloned().collect(),
            books,
            shelf: self.shelf.values().cloned().collect(),
            ..Snapshot::default()
        }
    }
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::from_snapshot(Snapshot::default())
    }

    /// Create a memory store from previously persisted data.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            tables: RwLock::new(Tables::from_snapshot(snapshot)),
        }
    }

    /// Copy the current contents into a serializable snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.tables.read().to_snapshot()
    }

    /// An independent copy to stage mutations on.
    pub(super) fn fork(&self) -> Self {
        Self {
            tables: RwLock::new(self.tables.read().clone()),
        }
    }

    /// Adopt the contents of a staged copy.
    pub(super) fn replace(&self, staged: MemoryStore) {
        *self.tables.write() = staged.tables.into_inner();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("MemoryStore")
            .field("accounts", &tables.accounts.len())
            .field("entries", &tables.entries.len())
            .field("sites", &tables.sites.len())
            .finish()
    }
}

fn account_not_found(id: &AccountId) -> StoreError {
    StoreError::NotFound {
        entity: "account",
        key: id.to_string(),
    }
}

fn check_projection(commit: &LedgerCommit) -> Result<(), StoreError> {
    if commit.lifetime_earned.checked_sub(commit.lifetime_spent) != Some(commit.balance) {
        return Err(StoreError::Backend {
            message: format!(
                "rejected inconsistent projection for account {}",
                commit.account_id
            ),
        });
    }
    Ok(())
}

fn site_not_found(id: &SiteId) -> StoreError {
    StoreError::NotFound {
        entity: "site",
        key: id.to_string(),
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.tables.read().accounts.get(id).cloned())
    }

    async fn find_account_by_email(&self, email: &Email) -> Result<Option<Account>, StoreError> {
        let tables = self.tables.read();
        Ok(tables.accounts.values().find(|a| &a.email == email).cloned())
    }

    async fn find_account_by_identity(
        &self,
        subject: &str,
    ) -> Result<Option<Account>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .accounts
            .values()
            .find(|a| a.identity_id.as_deref() == Some(subject))
            .cloned())
    }

    async fn find_account_by_referral_code(
        &self,
        code: &ReferralCode,
    ) -> Result<Option<Account>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .accounts
            .values()
            .find(|a| &a.referral_code == code)
            .cloned())
    }

    async fn open_account(&self, opening: AccountOpening) -> Result<Account, StoreError> {
        let AccountOpening {
            account,
            welcome,
            referral,
        } = opening;

        let opened = welcome.as_ref().map(|e| e.amount).unwrap_or(0);
        if !account.is_consistent()
            || account.lifetime_spent != 0
            || i64::try_from(account.lifetime_earned) != Ok(opened)
        {
            return Err(StoreError::Backend {
                message: format!("rejected inconsistent opening for account {}", account.id),
            });
        }
        if let Some(commit) = &referral {
            check_projection(commit)?;
        }

        let mut tables = self.tables.write();
        tables.check_new_account(&account)?;
        if let Some(commit) = &referral {
            tables.check_commit(commit)?;
        }

        if let Some(commit) = referral {
            tables.apply_commit(commit)?;
        }
        // Every check passed; nothing below can fail.
        tables.accounts.insert(account.id, account.clone());
        if let Some(entry) = welcome {
            tables.push_entry(account.id, entry, account.created_at);
        }
        Ok(account)
    }

    async fn link_identity(&self, id: &AccountId, subject: &str) -> Result<Account, StoreError> {
        let mut tables = self.tables.write();

        let taken = tables
            .accounts
            .values()
            .any(|a| a.id != *id && a.identity_id.as_deref() == Some(subject));
        if taken {
            return Err(StoreError::Conflict {
                field: "identity_id",
            });
        }

        let account = tables
            .accounts
            .get_mut(id)
            .ok_or_else(|| account_not_found(id))?;

        match account.identity_id.as_deref() {
            Some(current) if current != subject => Err(StoreError::Conflict {
                field: "identity_id",
            }),
            _ => {
                account.identity_id = Some(subject.to_string());
                Ok(account.clone())
            }
        }
    }

    async fn commit(&self, commit: LedgerCommit) -> Result<CommitReceipt, StoreError> {
        check_projection(&commit)?;

        let mut tables = self.tables.write();
        tables.check_commit(&commit)?;
        tables.apply_commit(commit)
    }

    async fn entries_for(&self, id: &AccountId) -> Result<Vec<LedgerEntry>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .entries
            .iter()
            .filter(|e| &e.account_id == id)
            .cloned()
            .collect())
    }

    async fn upsert_activity(
        &self,
        account: &AccountId,
        site: &SiteId,
        at: DateTime<Utc>,
    ) -> Result<SiteActivity, StoreError> {
        let mut tables = self.tables.write();
        let row = tables
            .activity
            .entry((*account, *site))
            .and_modify(|row| {
                row.visits += 1;
                row.last_visit = at;
            })
            .or_insert_with(|| SiteActivity {
                account_id: *account,
                site_id: *site,
                first_visit: at,
                last_visit: at,
                visits: 1,
            });
        Ok(row.clone())
    }

    async fn get_activity(
        &self,
        account: &AccountId,
        site: &SiteId,
    ) -> Result<Option<SiteActivity>, StoreError> {
        Ok(self.tables.read().activity.get(&(*account, *site)).cloned())
    }

    async fn insert_book(&self, book: NewBook) -> Result<Book, StoreError> {
        let mut tables = self.tables.write();
        let book = Book {
            id: BookId(tables.next_book_id),
            title: book.title,
            available_chapters: book.available_chapters,
            free_chapters: book.free_chapters,
            chapter_credit_cost: book.chapter_credit_cost,
            created_at: Utc::now(),
        };
        tables.next_book_id += 1;
        tables.books.insert(book.id, book.clone());
        Ok(book)
    }

    async fn get_book(&self, id: BookId) -> Result<Option<Book>, StoreError> {
        Ok(self.tables.read().books.get(&id).cloned())
    }

    async fn list_books(&self) -> Result<Vec<Book>, StoreError> {
        let mut books: Vec<Book> = self.tables.read().books.values().cloned().collect();
        books.sort_by_key(|b| b.id);
        Ok(books)
    }

    async fn get_shelf_entry(
        &self,
        account: &AccountId,
        book: BookId,
    ) -> Result<Option<ShelfEntry>, StoreError> {
        Ok(self.tables.read().shelf.get(&(*account, book)).cloned())
    }

    async fn shelf_for(&self, account: &AccountId) -> Result<Vec<ShelfEntry>, StoreError> {
        let tables = self.tables.read();
        let mut rows: Vec<ShelfEntry> = tables
            .shelf
            .values()
            .filter(|s| &s.account_id == account)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.book_id);
        Ok(rows)
    }

    async fn record_progress(
        &self,
        account: &AccountId,
        book: BookId,
        chapter: u32,
        at: DateTime<Utc>,
    ) -> Result<ShelfEntry, StoreError> {
        let mut tables = self.tables.write();
        if !tables.books.contains_key(&book) {
            return Err(StoreError::NotFound {
                entity: "book",
                key: book.to_string(),
            });
        }
        let row = tables
            .shelf
            .entry((*account, book))
            .or_insert_with(|| ShelfEntry::new(*account, book, at));
        row.last_chapter_read = chapter;
        row.updated_at = at;
        Ok(row.clone())
    }
}

#[async_trait]
impl SiteRegistry for MemoryStore {
    async fn find_site_by_api_key(&self, api_key: &str) -> Result<Option<Site>, StoreError> {
        let tables = self.tables.read();
        // Every key is compared so the scan takes the same time wherever the match is.
        let mut found = None;
        for site in tables.sites.values() {
            if site.api_key.matches(api_key) {
                found = Some(site);
            }
        }
        Ok(found.cloned())
    }

    async fn find_site_by_domain(&self, domain: &str) -> Result<Option<Site>, StoreError> {
        let domain = normalize_domain(domain);
        let tables = self.tables.read();
        Ok(tables.sites.values().find(|s| s.domain == domain).cloned())
    }

    async fn get_site(&self, id: &SiteId) -> Result<Option<Site>, StoreError> {
        Ok(self.tables.read().sites.get(id).cloned())
    }

    async fn list_sites(&self) -> Result<Vec<Site>, StoreError> {
        let tables = self.tables.read();
        let mut sites: Vec<Site> = tables.sites.values().cloned().collect();
        sites.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.domain.cmp(&b.domain)));
        Ok(sites)
    }

    async fn register_site(&self, site: Site) -> Result<Site, StoreError> {
        let mut tables = self.tables.write();
        for existing in tables.sites.values() {
            if existing.domain == site.domain {
                return Err(StoreError::Conflict { field: "domain" });
            }
            if existing.api_key == site.api_key {
                return Err(StoreError::Conflict { field: "api_key" });
            }
        }
        tables.sites.insert(site.id, site.clone());
        Ok(site)
    }

    async fn rotate_api_key(&self, id: &SiteId, api_key: Secret) -> Result<Site, StoreError> {
        let mut tables = self.tables.write();
        if tables
            .sites
            .values()
            .any(|s| s.id != *id && s.api_key == api_key)
        {
            return Err(StoreError::Conflict { field: "api_key" });
        }
        let site = tables.sites.get_mut(id).ok_or_else(|| site_not_found(id))?;
        site.api_key = api_key;
        Ok(site.clone())
    }

    async fn set_site_active(&self, id: &SiteId, active: bool) -> Result<Site, StoreError> {
        let mut tables = self.tables.write();
        let site = tables.sites.get_mut(id).ok_or_else(|| site_not_found(id))?;
        site.active = active;
        Ok(site.clone())
    }
}
