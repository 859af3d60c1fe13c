//! Bearer secrets and opaque token generation.
//!
//! This module provides:
//! - [`Secret`] - A wrapper for sensitive values that prevents accidental logging
//! - [`generate_site_api_key`] - `sk_`-prefixed site credentials (256 bits)
//! - [`generate_handoff_code`] - `AC_`-prefixed handoff codes (128 bits, URL-safe)
//! - [`generate_referral_code`] - Short human-typable referral codes
//! - [`mask_credential`] - Log-safe rendering of a credential

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Prefix of every site API key.
pub const SITE_API_KEY_PREFIX: &str = "sk_";

/// Prefix of every handoff code.
pub const HANDOFF_CODE_PREFIX: &str = "AC_";

const SITE_API_KEY_BYTES: usize = 32;
const HANDOFF_CODE_BYTES: usize = 16;
const SIGNING_SECRET_BYTES: usize = 32;
const REFERRAL_CODE_LEN: usize = 12;

// No 0/O or 1/I so codes survive being read aloud.
const REFERRAL_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// A secret value that prevents accidental exposure in logs.
///
/// The inner value is only accessible via [`expose()`](Secret::expose).
/// Debug and Display implementations show `[REDACTED]` instead of the value,
/// and the buffer is zeroed when dropped.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Create a new secret from a string value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret value.
    ///
    /// Use sparingly and never log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Consume the secret and return the inner value.
    pub fn into_inner(mut self) -> String {
        std::mem::take(&mut self.0)
    }

    /// Compare against a presented credential in constant time.
    ///
    /// Only the lengths are compared in variable time.
    pub fn matches(&self, presented: &str) -> bool {
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }

    /// Log-safe rendering, see [`mask_credential`].
    pub fn masked(&self) -> String {
        mask_credential(&self.0)
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.0)
    }
}

impl Eq for Secret {}

fn random_token(prefix: &str, bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    let token = format!("{}{}", prefix, URL_SAFE_NO_PAD.encode(&buf));
    buf.zeroize();
    token
}

/// Generate a new site API key.
pub fn generate_site_api_key() -> Secret {
    Secret::new(random_token(SITE_API_KEY_PREFIX, SITE_API_KEY_BYTES))
}

/// Generate a new single-use handoff code.
pub fn generate_handoff_code() -> String {
    random_token(HANDOFF_CODE_PREFIX, HANDOFF_CODE_BYTES)
}

/// Random key material for signing session tokens.
pub fn generate_signing_secret() -> Secret {
    Secret::new(random_token("", SIGNING_SECRET_BYTES))
}

/// Generate a referral code candidate.
///
/// Uniqueness is enforced by the store; callers regenerate on conflict.
pub fn generate_referral_code() -> String {
    let mut rng = OsRng;
    (0..REFERRAL_CODE_LEN)
        .map(|_| REFERRAL_ALPHABET[rng.gen_range(0..REFERRAL_ALPHABET.len())] as char)
        .collect()
}

/// Render a credential for logs: its prefix and last four characters.
///
/// # Examples
///
/// ```
/// use bookhub_core::secret::mask_credential;
///
/// assert_eq!(mask_credential("sk_abcdefghijklmnop"), "sk_…mnop");
/// assert_eq!(mask_credential("short"), "****");
/// ```
pub fn mask_credential(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let prefix: String = match value.find('_') {
        Some(idx) if idx < 4 => value[..=idx].to_string(),
        _ => String::new(),
    };
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}…{}", prefix, tail)
}
