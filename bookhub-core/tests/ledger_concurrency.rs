//! Integration tests for concurrent ledger mutations.
//!
//! These tests verify that racing mutations on one account are linearized:
//! - No spend succeeds past a zero balance
//! - No credit is lost when many earns race
//! - The balance decomposition holds after every run

use std::sync::Arc;

use bookhub_core::{
    Account, AccountDraft, AccountId, CreditLedger, Email, EntryKind, FileStore, LedgerError,
    LedgerStore, MemoryStore, NewBook, ReferralCode,
};
use tempfile::TempDir;

async fn funded_account(store: &dyn LedgerStore, ledger: &CreditLedger, credits: u64) -> AccountId {
    let account = Account::provision(
        AccountDraft::new(Email::parse("racer@example.com").unwrap()),
        ReferralCode::new("RACER001"),
    );
    let id = account.id;
    store.insert_account(account).await.unwrap();
    ledger
        .apply(&id, None, EntryKind::Earned, credits, "seed")
        .await
        .unwrap();
    id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_spends_of_six_against_ten() {
    for _ in 0..20 {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(CreditLedger::new(store.clone()));
        let id = funded_account(store.as_ref(), &ledger, 10).await;

        let spend = move |ledger: Arc<CreditLedger>| {
            tokio::spawn(async move {
                ledger
                    .apply(&id, None, EntryKind::Spent, 6, "Chapter 9")
                    .await
            })
        };
        let (a, b) = tokio::join!(spend(ledger.clone()), spend(ledger.clone()));
        let results = [a.unwrap(), b.unwrap()];

        let successes = results.iter().filter(|r| r.is_ok()).count();
        let insufficient = results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::InsufficientBalance { .. })))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(insufficient, 1);

        let account = store.get_account(&id).await.unwrap().unwrap();
        assert_eq!(account.balance, 4);
        assert!(account.is_consistent());
        assert_eq!(store.entries_for(&id).await.unwrap().len(), 2);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_spends_never_overdraw() {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(CreditLedger::with_max_attempts(store.clone(), 64));
    let id = funded_account(store.as_ref(), &ledger, 25).await;

    let handles: Vec<_> = (0..40)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.apply(&id, None, EntryKind::Spent, 1, "tick").await })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(LedgerError::InsufficientBalance { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(successes, 25);
    let account = store.get_account(&id).await.unwrap().unwrap();
    assert_eq!(account.balance, 0);
    assert_eq!(account.lifetime_spent, 25);
    assert!(account.is_consistent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_earns_are_not_lost() {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(CreditLedger::with_max_attempts(store.clone(), 64));
    let id = funded_account(store.as_ref(), &ledger, 1).await;

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .apply(&id, None, EntryKind::Earned, 3, "streak")
                    .await
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let account = store.get_account(&id).await.unwrap().unwrap();
    assert_eq!(account.balance, 1 + 32 * 3);
    assert_eq!(store.entries_for(&id).await.unwrap().len(), 33);

    let ids: std::collections::HashSet<_> = store
        .entries_for(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids.len(), 33);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_unlocks_respect_paid_chapters() {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(CreditLedger::with_max_attempts(store.clone(), 64));
    let id = funded_account(store.as_ref(), &ledger, 100).await;
    let book = store
        .insert_book(NewBook {
            title: "Harbor Lights".into(),
            available_chapters: 6,
            free_chapters: 2,
            chapter_credit_cost: 3,
        })
        .await
        .unwrap();

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.unlock_chapter(&id, book.id).await })
        })
        .collect();

    let mut unlocked = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            unlocked += 1;
        }
    }

    assert_eq!(unlocked, 4);
    let shelf = store.get_shelf_entry(&id, book.id).await.unwrap().unwrap();
    assert_eq!(shelf.unlocked_chapters, 4);
    let account = store.get_account(&id).await.unwrap().unwrap();
    assert_eq!(account.balance, 100 - 4 * 3);
    assert!(account.is_consistent());
}

#[tokio::test]
async fn test_file_store_ledger_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("ledger.json");

    let id = {
        let store = Arc::new(FileStore::load_from_path(path.clone()).unwrap());
        let ledger = CreditLedger::new(store.clone());
        let id = funded_account(store.as_ref(), &ledger, 12).await;
        ledger
            .apply(&id, None, EntryKind::Spent, 5, "Chapter 1")
            .await
            .unwrap();
        id
    };

    let store = Arc::new(FileStore::load_from_path(path).unwrap());
    let account = store.get_account(&id).await.unwrap().unwrap();
    assert_eq!(account.balance, 7);
    assert!(account.is_consistent());

    // Entry ids keep increasing after a reload.
    let ledger = CreditLedger::new(store.clone());
    let receipt = ledger
        .apply(&id, None, EntryKind::Earned, 1, "after restart")
        .await
        .unwrap();
    let history = ledger.history(&id).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].id, receipt.entry_id);
    assert!(history[0].id > history[1].id);
}
