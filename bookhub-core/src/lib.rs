//! # Bookhub Core
//!
//! Core library for the Bookhub identity and credit hub.
//!
//! A network of book sites shares one account per reader and one credit
//! balance per account. This crate provides:
//! - Domain types for accounts, sites, ledger entries and books
//! - The transactional credit ledger and login resolution flows
//! - Reading shelves with per-book progress
//! - Single-use cross-site handoff codes
//! - Collaborator traits with in-memory and file-backed implementations
//! - The [`Hub`] facade tying it all together
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bookhub_core::{Hub, PasswordLogin};
//!
//! async fn sign_in(hub: &Hub, api_key: &str) -> Result<u64, bookhub_core::HubError> {
//!     let login = PasswordLogin::new("reader@example.com", "correct-horse");
//!     let response = hub.password_login(api_key, &login).await?;
//!     Ok(response.account.credits)
//! }
//! ```

pub mod model;
pub mod secret;
pub mod store;
pub mod cache;
pub mod error;
pub mod ledger;
pub mod activity;
pub mod credentials;
pub mod identity;
pub mod session;
pub mod sites;
pub mod resolve;
pub mod handoff;
pub mod shelf;
pub mod config;
pub mod hub;

// Re-export commonly used types at crate root
pub use model::{
    Account,
    AccountDraft,
    AccountId,
    Book,
    BookId,
    Email,
    EntryId,
    EntryKind,
    LedgerEntry,
    MAX_CREDITS,
    NewBook,
    ReferralCode,
    ShelfEntry,
    Site,
    SiteActivity,
    SiteId,
};

pub use secret::Secret;

pub use store::{
    AccountOpening,
    FileStore,
    LedgerStore,
    MemoryStore,
    SiteRegistry,
    StoreError,
};

pub use cache::{
    CodeStore,
    CodeStoreError,
    MemoryCodeStore,
};

pub use error::{
    Classify,
    ErrorKind,
    HubError,
};

pub use ledger::{
    ChapterUnlock,
    CreditLedger,
    Grant,
    LedgerError,
    LedgerReceipt,
};

pub use activity::SiteActivityTracker;

pub use credentials::{
    Argon2Credentials,
    CredentialError,
    CredentialValidator,
};

pub use identity::{
    IdentityClaims,
    IdentityError,
    IdentityProvider,
    JwtIdentityProvider,
    StaticIdentityProvider,
};

pub use session::{
    JwtSessionIssuer,
    SessionError,
    SessionIssuer,
    SessionTokens,
};

pub use sites::{
    SiteAuthError,
    SiteDirectory,
};

pub use resolve::{
    AccountResolver,
    PasswordLogin,
    Resolution,
    ResolveError,
    WelcomeBonuses,
};

pub use handoff::{
    CrossPromoLink,
    HandoffError,
    HandoffProtocol,
    IssuedHandoff,
};

pub use shelf::{
    Bookshelf,
    ShelfError,
    ShelfItem,
};

pub use config::HubSettings;

pub use hub::{
    AccountView,
    Collaborators,
    CreditUpdate,
    Hub,
    LoginResponse,
};
