//! Per-site visit tracking.

use chrono::Utc;
use std::sync::Arc;

use crate::model::{AccountId, SiteActivity, SiteId};
use crate::store::{LedgerStore, StoreError};

/// Best-effort recorder of which sites an account has visited.
///
/// Recording never fails the caller: a store error is logged and swallowed,
/// since a login or handoff must succeed even when telemetry cannot be
/// written.
#[derive(Clone)]
pub struct SiteActivityTracker {
    store: Arc<dyn LedgerStore>,
}

impl SiteActivityTracker {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Count one visit of `account` through `site`.
    ///
    /// Returns the updated row, or `None` if the store rejected the write.
    pub async fn record_visit(&self, account: &AccountId, site: &SiteId) -> Option<SiteActivity> {
        match self.store.upsert_activity(account, site, Utc::now()).await {
            Ok(activity) => {
                tracing::debug!(
                    "Account {} visit {} on site {}",
                    account,
                    activity.visits,
                    site
                );
                Some(activity)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to record visit of account {} on site {}: {}",
                    account,
                    site,
                    e
                );
                None
            }
        }
    }

    /// Read the activity row for a pair, if any.
    pub async fn visits(
        &self,
        account: &AccountId,
        site: &SiteId,
    ) -> Result<Option<SiteActivity>, StoreError> {
        self.store.get_activity(account, site).await
    }
}

impl std::fmt::Debug for SiteActivityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteActivityTracker").finish_non_exhaustive()
    }
}
