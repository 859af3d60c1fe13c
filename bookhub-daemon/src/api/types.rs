//! API request/response types for the daemon JSON-RPC interface.
//!
//! Every method takes a single named-object params value. Result types that
//! the hub already defines (`LoginResponse`, `CreditUpdate`, `ChapterUnlock`,
//! `IssuedHandoff`, `AccountView`) are returned as-is.

use bookhub_core::{Book, CrossPromoLink, LedgerEntry, ShelfItem};
use serde::{Deserialize, Serialize};

/// Email/password login through a site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordLoginRequest {
    /// API key of the calling site
    pub api_key: String,
    pub email: String,
    pub password: String,
    /// Referral code captured on the site's sign-up page
    #[serde(default)]
    pub referral_code: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

/// Login with an identity-provider token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedLoginRequest {
    pub api_key: String,
    pub identity_token: String,
    #[serde(default)]
    pub referral_code: Option<String>,
}

/// Credit mutation on behalf of a site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCreditsRequest {
    pub api_key: String,
    pub access_token: String,
    /// One of `earned`, `spent`, `referral_bonus`, `welcome_bonus`
    pub kind: String,
    /// Magnitude of the change; always positive
    pub amount: u64,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockChapterRequest {
    pub access_token: String,
    pub book_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueHandoffRequest {
    pub access_token: String,
    /// Destination site domain
    pub domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeemHandoffRequest {
    /// API key of the redeeming site
    pub api_key: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossPromoRequest {
    pub access_token: String,
    /// Domain to leave out, usually the caller's own
    #[serde(default)]
    pub exclude_domain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossPromoResponse {
    pub links: Vec<CrossPromoLink>,
}

/// Params for methods that only need the account's session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenRequest {
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerHistoryResponse {
    /// Entries, newest first
    pub entries: Vec<LedgerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BooksResponse {
    pub books: Vec<Book>,
}

/// Report the last chapter read of a book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordProgressRequest {
    pub access_token: String,
    pub book_id: u64,
    /// 0 shelves the book without marking a chapter read
    pub chapter: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShelfResponse {
    /// Ordered by book id
    pub items: Vec<ShelfItem>,
}
