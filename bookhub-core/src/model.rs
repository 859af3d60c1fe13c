//! Domain model types for Bookhub.
//!
//! This module defines the core records shared by every component:
//! - [`AccountId`], [`SiteId`], [`BookId`], [`EntryId`] - Identifiers
//! - [`Email`] and [`ReferralCode`] - Normalized lookup keys
//! - [`Account`] - Identity and credit balance projection
//! - [`Site`] - A registered book site
//! - [`LedgerEntry`] and [`EntryKind`] - Append-only credit log
//! - [`SiteActivity`] - Per-(account, site) visit counters
//! - [`Book`] and [`ShelfEntry`] - Catalogue and per-account unlock state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::secret::Secret;

/// Stable identifier for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(Uuid);

impl AccountId {
    /// Generate a fresh random account ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an account ID from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier for a registered site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(Uuid);

impl SiteId {
    /// Generate a fresh random site ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SiteId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Catalogue identifier for a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookId(pub u64);

impl fmt::Display for BookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned identifier of a ledger entry.
///
/// Ids increase monotonically in commit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A login email, trimmed and lowercased.
///
/// # Examples
///
/// ```
/// use bookhub_core::Email;
///
/// let email = Email::parse("  Reader@Example.COM ").unwrap();
/// assert_eq!(email.as_str(), "reader@example.com");
/// assert!(Email::parse("not-an-email").is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Email(String);

impl Email {
    /// Normalize and validate an email address.
    ///
    /// Returns `None` for empty input or input without a local part and domain.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase();
        let (local, domain) = normalized.split_once('@')?;
        if local.is_empty() || domain.is_empty() || normalized.contains(char::is_whitespace) {
            return None;
        }
        Some(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A referral code handed out to an account at creation.
///
/// Codes are immutable once assigned and unique across all accounts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferralCode(String);

impl ReferralCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReferralCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Largest balance, lifetime counter or single entry amount the ledger accepts.
///
/// Entries carry signed amounts, so every counter stays within `i64` and
/// the entries of an account always sum exactly to its counters.
pub const MAX_CREDITS: u64 = i64::MAX as u64;

/// Kind of a ledger entry.
///
/// The ledger derives the sign of an entry from its kind: [`EntryKind::Spent`]
/// debits the balance, every other kind credits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Earned,
    Spent,
    ReferralBonus,
    WelcomeBonus,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earned => "earned",
            Self::Spent => "spent",
            Self::ReferralBonus => "referral_bonus",
            Self::WelcomeBonus => "welcome_bonus",
        }
    }

    /// Whether entries of this kind decrease the balance.
    pub fn is_debit(&self) -> bool {
        matches!(self, Self::Spent)
    }

    /// Resolve a validated magnitude into the signed amount recorded in the log.
    pub fn signed(&self, magnitude: i64) -> i64 {
        let magnitude = magnitude.saturating_abs();
        if self.is_debit() { -magnitude } else { magnitude }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error parsing an [`EntryKind`].
#[derive(Debug, thiserror::Error)]
#[error("unknown ledger entry kind: {0}")]
pub struct UnknownEntryKind(pub String);

impl FromStr for EntryKind {
    type Err = UnknownEntryKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "earned" => Ok(Self::Earned),
            "spent" => Ok(Self::Spent),
            "referral_bonus" => Ok(Self::ReferralBonus),
            "welcome_bonus" => Ok(Self::WelcomeBonus),
            other => Err(UnknownEntryKind(other.to_string())),
        }
    }
}

/// An account shared across every site in the network.
///
/// `balance == lifetime_earned - lifetime_spent` holds after every committed
/// mutation. `version` is bumped by each ledger commit and is what the
/// ledger's compare-and-update is conditioned on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub email: Email,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    /// Federated identity subject, unique when present.
    pub identity_id: Option<String>,
    /// Opened by a password login. Only such accounts accept one.
    #[serde(default)]
    pub password_enabled: bool,
    pub referral_code: ReferralCode,
    pub referred_by: Option<AccountId>,
    pub balance: u64,
    pub lifetime_earned: u64,
    pub lifetime_spent: u64,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Account {
    /// Build a new zero-balance account.
    pub fn provision(draft: AccountDraft, referral_code: ReferralCode) -> Self {
        let now = Utc::now();
        Self {
            id: AccountId::new(),
            email: draft.email,
            first_name: draft.first_name,
            last_name: draft.last_name,
            identity_id: draft.identity_id,
            password_enabled: draft.password_enabled,
            referral_code,
            referred_by: None,
            balance: 0,
            lifetime_earned: 0,
            lifetime_spent: 0,
            version: 0,
            created_at: now,
            last_active: now,
        }
    }

    /// Check the balance decomposition invariant.
    pub fn is_consistent(&self) -> bool {
        self.lifetime_earned.checked_sub(self.lifetime_spent) == Some(self.balance)
    }
}

/// Profile data used to provision an account.
#[derive(Debug, Clone)]
pub struct AccountDraft {
    pub email: Email,
    pub first_name: String,
    pub last_name: String,
    pub identity_id: Option<String>,
    pub password_enabled: bool,
}

impl AccountDraft {
    pub fn new(email: Email) -> Self {
        Self {
            email,
            first_name: String::new(),
            last_name: String::new(),
            identity_id: None,
            password_enabled: false,
        }
    }

    pub fn with_names(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = first.into();
        self.last_name = last.into();
        self
    }

    pub fn with_identity(mut self, subject: impl Into<String>) -> Self {
        self.identity_id = Some(subject.into());
        self
    }

    pub fn with_password(mut self) -> Self {
        self.password_enabled = true;
        self
    }
}

/// A registered book site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub name: String,
    /// Lowercase host name, unique across sites.
    pub domain: String,
    /// Bearer credential the site presents on every call.
    pub api_key: Secret,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Site {
    /// Create an active site with the given credential.
    pub fn new(name: impl Into<String>, domain: &str, api_key: Secret) -> Self {
        Self {
            id: SiteId::new(),
            name: name.into(),
            domain: normalize_domain(domain),
            api_key,
            active: true,
            created_at: Utc::now(),
        }
    }
}

/// Normalize a site domain for storage and lookup.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('/').to_lowercase()
}

/// An immutable record of one balance change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub account_id: AccountId,
    /// Originating site; `None` for system-internal adjustments.
    pub site_id: Option<SiteId>,
    pub kind: EntryKind,
    /// Signed amount: negative for [`EntryKind::Spent`].
    pub amount: i64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Visit counters for one (account, site) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteActivity {
    pub account_id: AccountId,
    pub site_id: SiteId,
    pub first_visit: DateTime<Utc>,
    pub last_visit: DateTime<Utc>,
    pub visits: u64,
}

/// A catalogue book whose chapters can be unlocked with credits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub available_chapters: u32,
    pub free_chapters: u32,
    pub chapter_credit_cost: u64,
    pub created_at: DateTime<Utc>,
}

impl Book {
    /// Number of chapters that must be unlocked with credits.
    pub fn paid_chapters(&self) -> u32 {
        self.available_chapters.saturating_sub(self.free_chapters)
    }
}

/// Catalogue data for a new book; the store assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBook {
    pub title: String,
    pub available_chapters: u32,
    #[serde(default)]
    pub free_chapters: u32,
    #[serde(default = "default_chapter_cost")]
    pub chapter_credit_cost: u64,
}

fn default_chapter_cost() -> u64 {
    1
}

/// Per-account reading state for a book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShelfEntry {
    pub account_id: AccountId,
    pub book_id: BookId,
    pub unlocked_chapters: u32,
    pub last_chapter_read: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ShelfEntry {
    /// An empty row: nothing unlocked, nothing read.
    pub fn new(account_id: AccountId, book_id: BookId, at: DateTime<Utc>) -> Self {
        Self {
            account_id,
            book_id,
            unlocked_chapters: 0,
            last_chapter_read: 0,
            created_at: at,
            updated_at: at,
        }
    }

    /// Chapters that may be read: the free ones plus those unlocked.
    pub fn readable_chapters(&self, book: &Book) -> u32 {
        book.free_chapters
            .saturating_add(self.unlocked_chapters)
            .min(book.available_chapters)
    }

    /// Reading progress through `book` as a percentage.
    pub fn progress_percent(&self, book: &Book) -> f64 {
        if book.available_chapters == 0 {
            return 0.0;
        }
        f64::from(self.last_chapter_read.min(book.available_chapters)) * 100.0
            / f64::from(book.available_chapters)
    }
}
