//! Ephemeral key-value storage with per-key expiry.
//!
//! This module provides:
//! - [`CodeStore`] - Trait for TTL-keyed stores with an atomic `take`
//! - [`MemoryCodeStore`] - In-memory implementation
//!
//! # Contract
//!
//! An entry is visible from [`put`](CodeStore::put) until its TTL lapses or
//! until the first [`take`](CodeStore::take) returns it, whichever comes
//! first. `take` is atomic: of any number of concurrent `take` calls for the
//! same key, at most one observes the value.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

mod memory;

pub use memory::MemoryCodeStore;

/// Error type for ephemeral store operations.
#[derive(Debug, Error)]
pub enum CodeStoreError {
    /// The cache backend encountered an error.
    #[error("cache backend error: {message}")]
    Backend { message: String },
}

/// Abstraction over short-lived key-value caches.
#[async_trait]
pub trait CodeStore: Send + Sync {
    /// Store `value` under `key` for `ttl`, replacing any previous value.
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), CodeStoreError>;

    /// Read a live value without consuming it.
    async fn get(&self, key: &str) -> Result<Option<String>, CodeStoreError>;

    /// Remove and return a live value.
    ///
    /// Returns `Ok(None)` if the key never existed, expired, or was already taken.
    async fn take(&self, key: &str) -> Result<Option<String>, CodeStoreError>;

    /// Check if a live value exists without retrieving it.
    async fn contains(&self, key: &str) -> Result<bool, CodeStoreError> {
        Ok(self.get(key).await?.is_some())
    }
}
