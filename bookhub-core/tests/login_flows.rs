//! Integration tests for login resolution through the hub.
//!
//! These tests verify the end-to-end behavior of both login paths:
//! - Welcome and referral bonuses at provisioning
//! - Enumeration-safe rejection of bad credentials
//! - Federated logins matching by subject before email
//! - Visit counting per (account, site)

use std::sync::Arc;

use bookhub_core::{
    Argon2Credentials, Collaborators, Email, EntryKind, ErrorKind, Hub, HubSettings,
    IdentityClaims, JwtSessionIssuer, LedgerStore, MemoryCodeStore, MemoryStore, PasswordLogin,
    Secret, StaticIdentityProvider,
};

struct TestHub {
    hub: Hub,
    store: Arc<MemoryStore>,
    identity: Arc<StaticIdentityProvider>,
    site_key: Secret,
}

async fn test_hub() -> TestHub {
    let store = Arc::new(MemoryStore::new());
    let identity = Arc::new(StaticIdentityProvider::new());
    let hub = Hub::new(
        Collaborators {
            store: store.clone(),
            sites: store.clone(),
            codes: Arc::new(MemoryCodeStore::new()),
            credentials: Arc::new(Argon2Credentials::with_cost(8, 1).unwrap()),
            sessions: Arc::new(JwtSessionIssuer::new(
                &Secret::new("login-flow-session-secret-0123456789"),
                "bookhub-test",
            )),
            identity: identity.clone(),
        },
        HubSettings::default(),
    );
    let (_, site_key) = hub
        .register_site("Inkwell", "inkwell.example")
        .await
        .unwrap();
    TestHub {
        hub,
        store,
        identity,
        site_key,
    }
}

#[tokio::test]
async fn test_new_account_gets_plain_welcome_bonus() {
    let t = test_hub().await;
    let response = t
        .hub
        .password_login(t.site_key.expose(), &PasswordLogin::new("plain@example.com", "pw"))
        .await
        .unwrap();

    assert!(response.is_new);
    assert_eq!(response.account.credits, 5);
    assert_eq!(response.account.referral_code.len(), 12);

    let entries = t.store.entries_for(&response.account.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, EntryKind::WelcomeBonus);
    assert_eq!(entries[0].amount, 5);
}

#[tokio::test]
async fn test_referral_bonus_for_both_sides() {
    let t = test_hub().await;
    let referrer = t
        .hub
        .password_login(t.site_key.expose(), &PasswordLogin::new("host@example.com", "pw"))
        .await
        .unwrap()
        .account;

    let login = PasswordLogin::new("guest@example.com", "pw").with_referral(&referrer.referral_code);
    let guest = t
        .hub
        .password_login(t.site_key.expose(), &login)
        .await
        .unwrap()
        .account;

    assert_eq!(guest.credits, 10);
    let guest_entries = t.store.entries_for(&guest.id).await.unwrap();
    assert_eq!(guest_entries.len(), 1);
    assert_eq!(guest_entries[0].kind, EntryKind::WelcomeBonus);
    assert_eq!(guest_entries[0].amount, 10);

    let host = t.store.get_account(&referrer.id).await.unwrap().unwrap();
    assert_eq!(host.balance, referrer.credits + 10);
    let host_entries = t.store.entries_for(&referrer.id).await.unwrap();
    let referral: Vec<_> = host_entries
        .iter()
        .filter(|e| e.kind == EntryKind::ReferralBonus)
        .collect();
    assert_eq!(referral.len(), 1);
    assert_eq!(referral[0].amount, 10);
}

#[tokio::test]
async fn test_wrong_password_and_unknown_site_look_alike_to_callers() {
    let t = test_hub().await;
    t.hub
        .password_login(t.site_key.expose(), &PasswordLogin::new("known@example.com", "right"))
        .await
        .unwrap();

    let wrong = t
        .hub
        .password_login(t.site_key.expose(), &PasswordLogin::new("known@example.com", "wrong"))
        .await
        .unwrap_err();
    assert_eq!(wrong.kind(), ErrorKind::AuthenticationFailure);
    assert_eq!(
        wrong.kind().public_message(),
        ErrorKind::AuthenticationFailure.public_message()
    );
}

#[tokio::test]
async fn test_federated_subject_match_wins_over_email() {
    let t = test_hub().await;

    // An account already linked to subject g-1.
    t.identity.insert(
        "token-a",
        IdentityClaims::new("g-1", Email::parse("first@example.com").unwrap()),
    );
    let linked = t
        .hub
        .federated_login(t.site_key.expose(), "token-a", None)
        .await
        .unwrap()
        .account;

    // An unrelated password account whose email the provider now reports.
    let other = t
        .hub
        .password_login(t.site_key.expose(), &PasswordLogin::new("second@example.com", "pw"))
        .await
        .unwrap()
        .account;

    t.identity.insert(
        "token-b",
        IdentityClaims::new("g-1", Email::parse("second@example.com").unwrap()),
    );
    let resolved = t
        .hub
        .federated_login(t.site_key.expose(), "token-b", None)
        .await
        .unwrap();

    assert!(!resolved.is_new);
    assert_eq!(resolved.account.id, linked.id);
    assert_ne!(resolved.account.id, other.id);

    let other = t.store.get_account(&other.id).await.unwrap().unwrap();
    assert!(other.identity_id.is_none());
}

#[tokio::test]
async fn test_federated_referral() {
    let t = test_hub().await;
    let host = t
        .hub
        .password_login(t.site_key.expose(), &PasswordLogin::new("fedhost@example.com", "pw"))
        .await
        .unwrap()
        .account;

    t.identity.insert(
        "token-new",
        IdentityClaims::new("g-55", Email::parse("fedguest@example.com").unwrap()),
    );
    let guest = t
        .hub
        .federated_login(t.site_key.expose(), "token-new", Some(host.referral_code.as_str()))
        .await
        .unwrap();

    assert!(guest.is_new);
    assert_eq!(guest.account.credits, 10);
    let host = t.store.get_account(&host.id).await.unwrap().unwrap();
    assert_eq!(host.balance, 15);
}

#[tokio::test]
async fn test_repeated_logins_count_visits_without_duplicates() {
    let t = test_hub().await;
    let login = PasswordLogin::new("regular@example.com", "pw");
    let site = t.hub.sites().authenticate(t.site_key.expose()).await.unwrap();

    let mut last = 0;
    let mut account_id = None;
    for _ in 0..5 {
        let response = t
            .hub
            .password_login(t.site_key.expose(), &login)
            .await
            .unwrap();
        account_id = Some(response.account.id);
        let visits = t
            .store
            .get_activity(&response.account.id, &site.id)
            .await
            .unwrap()
            .unwrap()
            .visits;
        assert!(visits > last);
        last = visits;
    }

    assert_eq!(last, 5);
    let snapshot = t.store.snapshot();
    let rows = snapshot
        .activity
        .iter()
        .filter(|a| Some(a.account_id) == account_id)
        .count();
    assert_eq!(rows, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_logins_share_one_account() {
    let t = Arc::new(test_hub().await);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let t = t.clone();
            tokio::spawn(async move {
                t.hub
                    .password_login(
                        t.site_key.expose(),
                        &PasswordLogin::new("stampede@example.com", "same-password"),
                    )
                    .await
            })
        })
        .collect();

    let mut ids = std::collections::HashSet::new();
    let mut created = 0;
    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        ids.insert(response.account.id);
        if response.is_new {
            created += 1;
        }
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(created, 1);

    let snapshot = t.store.snapshot();
    let accounts: Vec<_> = snapshot
        .accounts
        .iter()
        .filter(|a| a.email.as_str() == "stampede@example.com")
        .collect();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].balance, 5);
    assert_eq!(t.store.entries_for(&accounts[0].id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_first_logins_with_different_passwords() {
    let t = Arc::new(test_hub().await);
    let handles: Vec<_> = ["first-password", "second-password"]
        .into_iter()
        .map(|password| {
            let t = t.clone();
            tokio::spawn(async move {
                t.hub
                    .password_login(
                        t.site_key.expose(),
                        &PasswordLogin::new("contested@example.com", password),
                    )
                    .await
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = results.into_iter().find_map(Result::err).unwrap();
    assert_eq!(loser.kind(), ErrorKind::AuthenticationFailure);
}
