//! In-memory ephemeral store implementation.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{CodeStore, CodeStoreError};

struct CachedValue {
    value: String,
    expires_at: Instant,
}

impl CachedValue {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-memory TTL store.
///
/// Expiry is measured with [`tokio::time::Instant`], so tests running on a
/// paused runtime can advance the clock past a TTL. Expired entries are
/// invisible immediately and are swept on the next `put`.
pub struct MemoryCodeStore {
    entries: Mutex<HashMap<String, CachedValue>>,
}

impl MemoryCodeStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|v| v.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryCodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCodeStore")
            .field("live_entries", &self.len())
            .finish()
    }
}

#[async_trait]
impl CodeStore for MemoryCodeStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), CodeStoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, v| v.is_live(now));
        entries.insert(
            key.to_string(),
            CachedValue {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CodeStoreError> {
        let now = Instant::now();
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.value.clone()))
    }

    async fn take(&self, key: &str) -> Result<Option<String>, CodeStoreError> {
        let now = Instant::now();
        let removed = self.entries.lock().remove(key);
        Ok(removed.filter(|v| v.is_live(now)).map(|v| v.value))
    }
}
