//! Credit ledger engine.
//!
//! [`CreditLedger`] is the only component that changes balances. Each call
//! reads the account, computes the next projection, and commits it together
//! with one immutable [`LedgerEntry`] conditioned on the account version it
//! read. A concurrent commit in between surfaces as a version conflict and the
//! whole read-compute-commit cycle is retried, so two spends racing on the
//! same account are linearized and can never both pass a zero balance.
//!
//! # Example
//!
//! ```rust,ignore
//! use bookhub_core::{CreditLedger, EntryKind, MemoryStore};
//!
//! let ledger = CreditLedger::new(Arc::new(MemoryStore::new()));
//! let receipt = ledger
//!     .apply(&account_id, Some(&site_id), EntryKind::Spent, 3, "Chapter 4")
//!     .await?;
//! println!("balance now {}", receipt.balance);
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::model::{
    Account, AccountId, Book, BookId, EntryId, EntryKind, LedgerEntry, MAX_CREDITS, SiteId,
};
use crate::store::{
    AccountOpening, CommitReceipt, LedgerCommit, LedgerStore, NewLedgerEntry, StoreError,
};

/// Default bound on optimistic commit attempts per call.
pub const DEFAULT_MAX_COMMIT_ATTEMPTS: u32 = 16;

/// Error type for ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Mutations move between one and [`MAX_CREDITS`] credits.
    #[error("amount must be between 1 and {}", MAX_CREDITS)]
    InvalidAmount,

    /// The spend exceeds the current balance.
    #[error("insufficient balance: have {balance}, need {requested}")]
    InsufficientBalance { balance: u64, requested: u64 },

    /// The account does not exist.
    #[error("account not found: {account}")]
    AccountNotFound { account: AccountId },

    /// The book does not exist.
    #[error("book not found: {book}")]
    BookNotFound { book: BookId },

    /// Every paid chapter of the book is already unlocked.
    #[error("no locked chapters left in book {book}")]
    NothingToUnlock { book: BookId },

    /// Crediting would overflow the balance counters.
    #[error("credit would overflow account {account}")]
    Overflow { account: AccountId },

    /// The account kept changing underneath every attempt.
    #[error("gave up after {attempts} conflicting commits on account {account}")]
    Contention { account: AccountId, attempts: u32 },

    /// Error from the underlying store.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl Classify for LedgerError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAmount => ErrorKind::InvalidRequest,
            Self::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            Self::AccountNotFound { .. } | Self::BookNotFound { .. } => ErrorKind::NotFound,
            Self::NothingToUnlock { .. } => ErrorKind::Conflict,
            Self::Overflow { .. } | Self::Contention { .. } => ErrorKind::Internal,
            Self::Store(e) => e.kind(),
        }
    }
}

/// Outcome of a successful [`CreditLedger::apply`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerReceipt {
    /// Balance after the mutation.
    pub balance: u64,
    /// Id of the entry written for the mutation.
    pub entry_id: EntryId,
}

/// Outcome of a successful [`CreditLedger::unlock_chapter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterUnlock {
    pub book_id: BookId,
    pub unlocked_chapters: u32,
    pub remaining_balance: u64,
    pub entry_id: EntryId,
}

/// A credit granted while opening an account.
#[derive(Debug, Clone, Copy)]
pub struct Grant<'a> {
    pub amount: u64,
    pub description: &'a str,
}

impl<'a> Grant<'a> {
    pub fn new(amount: u64, description: &'a str) -> Self {
        Self {
            amount,
            description,
        }
    }
}

/// Check an amount and return it as the magnitude of a log entry.
fn magnitude(amount: u64) -> Result<i64, LedgerError> {
    i64::try_from(amount)
        .ok()
        .filter(|m| *m > 0)
        .ok_or(LedgerError::InvalidAmount)
}

/// The next `(balance, lifetime_earned, lifetime_spent)` for a mutation.
struct Projection {
    balance: u64,
    lifetime_earned: u64,
    lifetime_spent: u64,
}

fn project(account: &Account, kind: EntryKind, amount: u64) -> Result<Projection, LedgerError> {
    let overflow = || LedgerError::Overflow {
        account: account.id,
    };
    let add = |counter: u64| {
        counter
            .checked_add(amount)
            .filter(|v| *v <= MAX_CREDITS)
            .ok_or_else(overflow)
    };

    if kind.is_debit() {
        if amount > account.balance {
            return Err(LedgerError::InsufficientBalance {
                balance: account.balance,
                requested: amount,
            });
        }
        Ok(Projection {
            balance: account.balance - amount,
            lifetime_earned: account.lifetime_earned,
            lifetime_spent: add(account.lifetime_spent)?,
        })
    } else {
        Ok(Projection {
            balance: add(account.balance)?,
            lifetime_earned: add(account.lifetime_earned)?,
            lifetime_spent: account.lifetime_spent,
        })
    }
}

/// The transactional credit ledger.
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    max_attempts: u32,
}

impl CreditLedger {
    /// Create a ledger over the given store with the default retry bound.
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_max_attempts(store, DEFAULT_MAX_COMMIT_ATTEMPTS)
    }

    /// Create a ledger with a custom bound on commit attempts.
    pub fn with_max_attempts(store: Arc<dyn LedgerStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Apply one mutation and return the new balance.
    ///
    /// `amount` is a magnitude; the sign comes from `kind`. A spend larger
    /// than the balance fails with [`LedgerError::InsufficientBalance`] and
    /// writes nothing.
    pub async fn apply(
        &self,
        account: &AccountId,
        site: Option<&SiteId>,
        kind: EntryKind,
        amount: u64,
        description: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        let receipt = self
            .commit_with_retry(account, site, kind, amount, description, None)
            .await?;

        tracing::debug!(
            "Applied {} of {} to account {} (balance {})",
            kind,
            amount,
            account,
            receipt.account.balance
        );

        Ok(LedgerReceipt {
            balance: receipt.account.balance,
            entry_id: receipt.entry.id,
        })
    }

    /// Spend a book's chapter cost and unlock its next chapter in one commit.
    pub async fn unlock_chapter(
        &self,
        account: &AccountId,
        book: BookId,
    ) -> Result<ChapterUnlock, LedgerError> {
        let book = self
            .store
            .get_book(book)
            .await?
            .ok_or(LedgerError::BookNotFound { book })?;

        let description = format!("Unlocked chapter of {}", book.title);
        let receipt = self
            .commit_with_retry(
                account,
                None,
                EntryKind::Spent,
                book.chapter_credit_cost,
                &description,
                Some(&book),
            )
            .await?;

        let unlocked_chapters = receipt
            .shelf
            .as_ref()
            .map(|s| s.unlocked_chapters)
            .unwrap_or_default();

        tracing::info!(
            "Account {} unlocked chapter {} of book {}",
            account,
            unlocked_chapters,
            book.id
        );

        Ok(ChapterUnlock {
            book_id: book.id,
            unlocked_chapters,
            remaining_balance: receipt.account.balance,
            entry_id: receipt.entry.id,
        })
    }

    /// Insert a new account together with its welcome credit and, when it
    /// was referred, the referrer's bonus.
    ///
    /// All of it lands in one store write, so an account never exists
    /// without the credits it was opened with. A concurrent commit on the
    /// referrer is retried like any other version conflict.
    pub async fn open_account(
        &self,
        mut account: Account,
        site: Option<&SiteId>,
        welcome: Option<Grant<'_>>,
        referral: Option<(AccountId, Grant<'_>)>,
    ) -> Result<Account, LedgerError> {
        let welcome = match welcome {
            Some(grant) => {
                let amount = magnitude(grant.amount)?;
                account.balance = grant.amount;
                account.lifetime_earned = grant.amount;
                account.lifetime_spent = 0;
                Some(NewLedgerEntry {
                    site_id: site.copied(),
                    kind: EntryKind::WelcomeBonus,
                    amount: EntryKind::WelcomeBonus.signed(amount),
                    description: grant.description.to_string(),
                })
            }
            None => None,
        };

        let Some((referrer_id, grant)) = referral else {
            let opening = AccountOpening {
                account,
                welcome,
                referral: None,
            };
            return Ok(self.store.open_account(opening).await?);
        };
        let bonus = magnitude(grant.amount)?;

        for attempt in 1..=self.max_attempts {
            let referrer = self.store.get_account(&referrer_id).await?.ok_or(
                LedgerError::AccountNotFound {
                    account: referrer_id,
                },
            )?;
            let next = project(&referrer, EntryKind::ReferralBonus, grant.amount)?;
            let opening = AccountOpening {
                account: account.clone(),
                welcome: welcome.clone(),
                referral: Some(LedgerCommit {
                    account_id: referrer_id,
                    expected_version: referrer.version,
                    balance: next.balance,
                    lifetime_earned: next.lifetime_earned,
                    lifetime_spent: next.lifetime_spent,
                    entry: NewLedgerEntry {
                        site_id: site.copied(),
                        kind: EntryKind::ReferralBonus,
                        amount: EntryKind::ReferralBonus.signed(bonus),
                        description: grant.description.to_string(),
                    },
                    unlock: None,
                    at: Utc::now(),
                }),
            };

            match self.store.open_account(opening).await {
                Ok(account) => return Ok(account),
                Err(StoreError::VersionConflict { found, .. }) => {
                    tracing::debug!(
                        "Opening attempt {} lost referrer {} to version {}, retrying",
                        attempt,
                        referrer_id,
                        found
                    );
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::error!(
            "Giving up opening account {} after {} conflicting commits on referrer {}",
            account.id,
            self.max_attempts,
            referrer_id
        );
        Err(LedgerError::Contention {
            account: referrer_id,
            attempts: self.max_attempts,
        })
    }

    /// Ledger entries for an account, newest first.
    pub async fn history(&self, account: &AccountId) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut entries = self.store.entries_for(account).await?;
        entries.reverse();
        Ok(entries)
    }

    async fn commit_with_retry(
        &self,
        account_id: &AccountId,
        site: Option<&SiteId>,
        kind: EntryKind,
        amount: u64,
        description: &str,
        unlock: Option<&Book>,
    ) -> Result<CommitReceipt, LedgerError> {
        let magnitude = magnitude(amount)?;

        for attempt in 1..=self.max_attempts {
            let account = self
                .store
                .get_account(account_id)
                .await?
                .ok_or(LedgerError::AccountNotFound {
                    account: *account_id,
                })?;

            if let Some(book) = unlock {
                let unlocked = self
                    .store
                    .get_shelf_entry(account_id, book.id)
                    .await?
                    .map(|s| s.unlocked_chapters)
                    .unwrap_or(0);
                if unlocked >= book.paid_chapters() {
                    return Err(LedgerError::NothingToUnlock { book: book.id });
                }
            }

            let next = project(&account, kind, amount)?;
            let commit = LedgerCommit {
                account_id: *account_id,
                expected_version: account.version,
                balance: next.balance,
                lifetime_earned: next.lifetime_earned,
                lifetime_spent: next.lifetime_spent,
                entry: NewLedgerEntry {
                    site_id: site.copied(),
                    kind,
                    amount: kind.signed(magnitude),
                    description: description.to_string(),
                },
                unlock: unlock.map(|b| b.id),
                at: Utc::now(),
            };

            match self.store.commit(commit).await {
                Ok(receipt) => return Ok(receipt),
                Err(StoreError::VersionConflict { found, .. }) => {
                    tracing::debug!(
                        "Commit attempt {} on account {} lost to version {}, retrying",
                        attempt,
                        account_id,
                        found
                    );
                    tokio::task::yield_now().await;
                }
                Err(StoreError::Conflict {
                    field: "unlocked_chapters",
                }) => {
                    let book = unlock.map(|b| b.id).unwrap_or(BookId(0));
                    return Err(LedgerError::NothingToUnlock { book });
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::error!(
            "Giving up on account {} after {} conflicting commits",
            account_id,
            self.max_attempts
        );
        Err(LedgerError::Contention {
            account: *account_id,
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccountDraft, Email, NewBook, ReferralCode};
    use crate::store::MemoryStore;

    async fn setup() -> (CreditLedger, Arc<MemoryStore>, AccountId) {
        let store = Arc::new(MemoryStore::new());
        let account = Account::provision(
            AccountDraft::new(Email::parse("ledger@example.com").unwrap()),
            ReferralCode::new("LEDGER01"),
        );
        let id = account.id;
        store.insert_account(account).await.unwrap();
        (CreditLedger::new(store.clone()), store, id)
    }

    #[tokio::test]
    async fn test_earn_then_spend() {
        let (ledger, store, id) = setup().await;

        let earned = ledger
            .apply(&id, None, EntryKind::Earned, 10, "Daily streak")
            .await
            .unwrap();
        assert_eq!(earned.balance, 10);

        let spent = ledger
            .apply(&id, None, EntryKind::Spent, 4, "Chapter 2")
            .await
            .unwrap();
        assert_eq!(spent.balance, 6);

        let account = store.get_account(&id).await.unwrap().unwrap();
        assert_eq!(account.lifetime_earned, 10);
        assert_eq!(account.lifetime_spent, 4);
        assert!(account.is_consistent());

        let history = ledger.history(&id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].amount, -4);
        assert_eq!(history[0].kind, EntryKind::Spent);
        assert_eq!(history[1].amount, 10);
    }

    #[tokio::test]
    async fn test_overspend_leaves_balance_untouched() {
        let (ledger, store, id) = setup().await;
        ledger
            .apply(&id, None, EntryKind::Earned, 3, "seed")
            .await
            .unwrap();

        let result = ledger.apply(&id, None, EntryKind::Spent, 4, "too much").await;
        assert!(matches!(
            result,
            Err(LedgerError::InsufficientBalance {
                balance: 3,
                requested: 4
            })
        ));

        let account = store.get_account(&id).await.unwrap().unwrap();
        assert_eq!(account.balance, 3);
        assert_eq!(store.entries_for(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_amount_rejected() {
        let (ledger, _store, id) = setup().await;
        let result = ledger.apply(&id, None, EntryKind::Earned, 0, "nothing").await;
        assert!(matches!(result, Err(LedgerError::InvalidAmount)));
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let (ledger, _store, _id) = setup().await;
        let result = ledger
            .apply(&AccountId::new(), None, EntryKind::Earned, 1, "ghost")
            .await;
        assert!(matches!(result, Err(LedgerError::AccountNotFound { .. })));
    }

    #[tokio::test]
    async fn test_apply_refreshes_last_active() {
        let (ledger, store, id) = setup().await;
        let before = store.get_account(&id).await.unwrap().unwrap().last_active;
        ledger
            .apply(&id, None, EntryKind::Earned, 1, "ping")
            .await
            .unwrap();
        let after = store.get_account(&id).await.unwrap().unwrap().last_active;
        assert!(after >= before);
    }

    #[tokio::test]
    async fn test_amount_beyond_entry_range_is_rejected() {
        let (ledger, store, id) = setup().await;
        for amount in [u64::MAX, MAX_CREDITS + 1] {
            let result = ledger.apply(&id, None, EntryKind::Earned, amount, "huge").await;
            assert!(matches!(result, Err(LedgerError::InvalidAmount)));
        }

        let account = store.get_account(&id).await.unwrap().unwrap();
        assert_eq!(account.balance, 0);
        assert!(store.entries_for(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overflow_is_rejected_and_entries_match_counters() {
        let (ledger, store, id) = setup().await;
        ledger
            .apply(&id, None, EntryKind::Earned, MAX_CREDITS, "max")
            .await
            .unwrap();
        let result = ledger.apply(&id, None, EntryKind::Earned, 1, "one more").await;
        assert!(matches!(result, Err(LedgerError::Overflow { .. })));

        let account = store.get_account(&id).await.unwrap().unwrap();
        let earned: i64 = store
            .entries_for(&id)
            .await
            .unwrap()
            .iter()
            .filter(|e| !e.kind.is_debit())
            .map(|e| e.amount)
            .sum();
        assert_eq!(u64::try_from(earned).unwrap(), account.lifetime_earned);
        assert_eq!(account.lifetime_earned, MAX_CREDITS);
    }

    #[tokio::test]
    async fn test_unlock_chapter_spends_and_counts() {
        let (ledger, store, id) = setup().await;
        let book = store
            .insert_book(NewBook {
                title: "The Lantern Road".into(),
                available_chapters: 3,
                free_chapters: 1,
                chapter_credit_cost: 2,
            })
            .await
            .unwrap();
        ledger
            .apply(&id, None, EntryKind::Earned, 5, "seed")
            .await
            .unwrap();

        let first = ledger.unlock_chapter(&id, book.id).await.unwrap();
        assert_eq!(first.unlocked_chapters, 1);
        assert_eq!(first.remaining_balance, 3);

        let second = ledger.unlock_chapter(&id, book.id).await.unwrap();
        assert_eq!(second.unlocked_chapters, 2);
        assert_eq!(second.remaining_balance, 1);

        // Two paid chapters, both unlocked.
        let third = ledger.unlock_chapter(&id, book.id).await;
        assert!(matches!(third, Err(LedgerError::NothingToUnlock { .. })));
    }

    #[tokio::test]
    async fn test_unlock_without_credits() {
        let (ledger, store, id) = setup().await;
        let book = store
            .insert_book(NewBook {
                title: "Paper Tides".into(),
                available_chapters: 5,
                free_chapters: 0,
                chapter_credit_cost: 1,
            })
            .await
            .unwrap();

        let result = ledger.unlock_chapter(&id, book.id).await;
        assert!(matches!(result, Err(LedgerError::InsufficientBalance { .. })));
        assert!(store.get_shelf_entry(&id, book.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unlock_unknown_book() {
        let (ledger, _store, id) = setup().await;
        let result = ledger.unlock_chapter(&id, BookId(99)).await;
        assert!(matches!(result, Err(LedgerError::BookNotFound { .. })));
    }

    #[tokio::test]
    async fn test_open_account_credits_both_sides() {
        let (ledger, store, referrer) = setup().await;
        let draft = AccountDraft::new(Email::parse("invited@example.com").unwrap());
        let account = Account::provision(draft, ReferralCode::new("INVITED1"));

        let opened = ledger
            .open_account(
                account,
                None,
                Some(Grant::new(10, "Welcome bonus + referral bonus")),
                Some((referrer, Grant::new(10, "Referral bonus"))),
            )
            .await
            .unwrap();
        assert_eq!(opened.balance, 10);
        assert!(opened.is_consistent());

        let referrer = store.get_account(&referrer).await.unwrap().unwrap();
        assert_eq!(referrer.balance, 10);
        let entries = store.entries_for(&referrer.id).await.unwrap();
        assert_eq!(entries[0].kind, EntryKind::ReferralBonus);
    }

    #[tokio::test]
    async fn test_open_account_with_invalid_grant_writes_nothing() {
        let (ledger, store, _) = setup().await;
        let draft = AccountDraft::new(Email::parse("greedy@example.com").unwrap());
        let account = Account::provision(draft, ReferralCode::new("GREEDY01"));

        let result = ledger
            .open_account(account, None, Some(Grant::new(u64::MAX, "too much")), None)
            .await;
        assert!(matches!(result, Err(LedgerError::InvalidAmount)));
        let email = Email::parse("greedy@example.com").unwrap();
        assert!(store.find_account_by_email(&email).await.unwrap().is_none());
    }

    #[test]
    fn test_error_classification() {
        let err = LedgerError::InsufficientBalance {
            balance: 1,
            requested: 2,
        };
        assert_eq!(err.kind(), ErrorKind::InsufficientBalance);
        assert_eq!(LedgerError::InvalidAmount.kind(), ErrorKind::InvalidRequest);
    }
}
