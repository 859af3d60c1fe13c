//! JSON-snapshot backed store.
//!
//! The full store contents live in memory (a [`MemoryStore`]) and are
//! rewritten to disk after every successful mutation. Writes go to a
//! temporary file first and are renamed into place, so a crash mid-write
//! leaves the previous snapshot intact.
//!
//! A mutation is applied to a staged copy of the working set and only
//! becomes visible once its snapshot is on disk. If the write fails the
//! caller gets the error and the mutation never happened.
//!
//! Every mutation, visit upserts included, copies and rewrites the whole
//! snapshot. That is fine for a hub with a few thousand accounts; a larger
//! deployment wants a transactional database behind [`LedgerStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{
    AccountOpening, CommitReceipt, LedgerCommit, LedgerStore, MemoryStore, SiteRegistry,
    Snapshot, StoreError,
};
use crate::model::{
    Account, AccountId, Book, BookId, Email, LedgerEntry, NewBook, ReferralCode, ShelfEntry, Site,
    SiteActivity, SiteId,
};
use crate::secret::Secret;

/// Disk-backed store.
///
/// # Thread Safety
///
/// Reads go straight to the inner [`MemoryStore`]. Mutations are serialized
/// by an async mutex held from staging until the staged copy is published,
/// so snapshots reach the disk in the order their mutations were applied.
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Load the store from a specific path.
    ///
    /// Creates parent directories if they don't exist; a missing file starts
    /// an empty store.
    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let snapshot = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Snapshot::default()
        };

        tracing::debug!(
            "Loaded ledger snapshot from {:?} ({} accounts, {} entries)",
            path,
            snapshot.accounts.len(),
            snapshot.entries.len()
        );

        Ok(Self {
            path,
            inner: MemoryStore::from_snapshot(snapshot),
            write_lock: Mutex::new(()),
        })
    }

    /// Get the storage path for this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a staged copy to disk, then make it the working set.
    ///
    /// The caller holds `write_lock`.
    async fn publish(&self, staged: MemoryStore) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(&staged.snapshot())?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&path, &contents))
            .await
            .map_err(|e| StoreError::Backend {
                message: format!("snapshot writer failed: {}", e),
            })?
            .inspect_err(|e| {
                tracing::warn!("Failed to write ledger snapshot to {:?}: {}", self.path, e);
            })?;

        self.inner.replace(staged);
        Ok(())
    }
}

fn write_snapshot(path: &Path, contents: &str) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("inner", &self.inner)
            .finish()
    }
}

#[async_trait]
impl LedgerStore for FileStore {
    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        self.inner.get_account(id).await
    }

    async fn find_account_by_email(&self, email: &Email) -> Result<Option<Account>, StoreError> {
        self.inner.find_account_by_email(email).await
    }

    async fn find_account_by_identity(
        &self,
        subject: &str,
    ) -> Result<Option<Account>, StoreError> {
        self.inner.find_account_by_identity(subject).await
    }

    async fn find_account_by_referral_code(
        &self,
        code: &ReferralCode,
    ) -> Result<Option<Account>, StoreError> {
        self.inner.find_account_by_referral_code(code).await
    }

    async fn open_account(&self, opening: AccountOpening) -> Result<Account, StoreError> {
        let _guard = self.write_lock.lock().await;
        let staged = self.inner.fork();
        let account = staged.open_account(opening).await?;
        self.publish(staged).await?;
        Ok(account)
    }

    async fn link_identity(&self, id: &AccountId, subject: &str) -> Result<Account, StoreError> {
        let _guard = self.write_lock.lock().await;
        let staged = self.inner.fork();
        let account = staged.link_identity(id, subject).await?;
        self.publish(staged).await?;
        Ok(account)
    }

    async fn commit(&self, commit: LedgerCommit) -> Result<CommitReceipt, StoreError> {
        let _guard = self.write_lock.lock().await;
        let staged = self.inner.fork();
        let receipt = staged.commit(commit).await?;
        self.publish(staged).await?;
        Ok(receipt)
    }

    async fn entries_for(&self, id: &AccountId) -> Result<Vec<LedgerEntry>, StoreError> {
        self.inner.entries_for(id).await
    }

    async fn upsert_activity(
        &self,
        account: &AccountId,
        site: &SiteId,
        at: DateTime<Utc>,
    ) -> Result<SiteActivity, StoreError> {
        let _guard = self.write_lock.lock().await;
        let staged = self.inner.fork();
        let activity = staged.upsert_activity(account, site, at).await?;
        self.publish(staged).await?;
        Ok(activity)
    }

    async fn get_activity(
        &self,
        account: &AccountId,
        site: &SiteId,
    ) -> Result<Option<SiteActivity>, StoreError> {
        self.inner.get_activity(account, site).await
    }

    async fn insert_book(&self, book: NewBook) -> Result<Book, StoreError> {
        let _guard = self.write_lock.lock().await;
        let staged = self.inner.fork();
        let book = staged.insert_book(book).await?;
        self.publish(staged).await?;
        Ok(book)
    }

    async fn get_book(&self, id: BookId) -> Result<Option<Book>, StoreError> {
        self.inner.get_book(id).await
    }

    async fn list_books(&self) -> Result<Vec<Book>, StoreError> {
        self.inner.list_books().await
    }

    async fn get_shelf_entry(
        &self,
        account: &AccountId,
        book: BookId,
    ) -> Result<Option<ShelfEntry>, StoreError> {
        self.inner.get_shelf_entry(account, book).await
    }

    async fn shelf_for(&self, account: &AccountId) -> Result<Vec<ShelfEntry>, StoreError> {
        self.inner.shelf_for(account).await
    }

    async fn record_progress(
        &self,
        account: &AccountId,
        book: BookId,
        chapter: u32,
        at: DateTime<Utc>,
    ) -> Result<ShelfEntry, StoreError> {
        let _guard = self.write_lock.lock().await;
        let staged = self.inner.fork();
        let row = staged.record_progress(account, book, chapter, at).await?;
        self.publish(staged).await?;
        Ok(row)
    }
}

#[async_trait]
impl SiteRegistry for FileStore {
    async fn find_site_by_api_key(&self, api_key: &str) -> Result<Option<Site>, StoreError> {
        self.inner.find_site_by_api_key(api_key).await
    }

    async fn find_site_by_domain(&self, domain: &str) -> Result<Option<Site>, StoreError> {
        self.inner.find_site_by_domain(domain).await
    }

    async fn get_site(&self, id: &SiteId) -> Result<Option<Site>, StoreError> {
        self.inner.get_site(id).await
    }

    async fn list_sites(&self) -> Result<Vec<Site>, StoreError> {
        self.inner.list_sites().await
    }

    async fn register_site(&self, site: Site) -> Result<Site, StoreError> {
        let _guard = self.write_lock.lock().await;
        let staged = self.inner.fork();
        let site = staged.register_site(site).await?;
        self.publish(staged).await?;
        Ok(site)
    }

    async fn rotate_api_key(&self, id: &SiteId, api_key: Secret) -> Result<Site, StoreError> {
        let _guard = self.write_lock.lock().await;
        let staged = self.inner.fork();
        let site = staged.rotate_api_key(id, api_key).await?;
        self.publish(staged).await?;
        Ok(site)
    }

    async fn set_site_active(&self, id: &SiteId, active: bool) -> Result<Site, StoreError> {
        let _guard = self.write_lock.lock().await;
        let staged = self.inner.fork();
        let site = staged.set_site_active(id, active).await?;
        self.publish(staged).await?;
        Ok(site)
    }
}
