//! Tunable hub behavior.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::handoff::{DEFAULT_HANDOFF_TTL_SECS, DEFAULT_REDEMPTION_PATH};
use crate::ledger::DEFAULT_MAX_COMMIT_ATTEMPTS;
use crate::resolve::WelcomeBonuses;

/// Settings for a [`Hub`](crate::Hub).
///
/// Every field has a default, so a partial `[hub]` table in a config file
/// only overrides what it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Credits for a new account without a referral.
    pub welcome_bonus: u64,
    /// Credits for a new account whose referral code resolved.
    pub referral_welcome_bonus: u64,
    /// Credits for the referring account.
    pub referrer_bonus: u64,
    /// Lifetime of a handoff code in seconds.
    pub handoff_ttl_secs: u64,
    /// Optimistic commit attempts per ledger call.
    pub max_commit_attempts: u32,
    /// Path on the destination site that redeems a handoff code.
    pub redemption_path: String,
}

impl Default for HubSettings {
    fn default() -> Self {
        let bonuses = WelcomeBonuses::default();
        Self {
            welcome_bonus: bonuses.welcome,
            referral_welcome_bonus: bonuses.referral_welcome,
            referrer_bonus: bonuses.referrer,
            handoff_ttl_secs: DEFAULT_HANDOFF_TTL_SECS,
            max_commit_attempts: DEFAULT_MAX_COMMIT_ATTEMPTS,
            redemption_path: DEFAULT_REDEMPTION_PATH.to_string(),
        }
    }
}

impl HubSettings {
    pub fn bonuses(&self) -> WelcomeBonuses {
        WelcomeBonuses {
            welcome: self.welcome_bonus,
            referral_welcome: self.referral_welcome_bonus,
            referrer: self.referrer_bonus,
        }
    }

    pub fn handoff_ttl(&self) -> Duration {
        Duration::from_secs(self.handoff_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = HubSettings::default();
        assert_eq!(settings.welcome_bonus, 5);
        assert_eq!(settings.referral_welcome_bonus, 10);
        assert_eq!(settings.referrer_bonus, 10);
        assert_eq!(settings.handoff_ttl(), Duration::from_secs(300));
        assert_eq!(settings.max_commit_attempts, 16);
        assert_eq!(settings.redemption_path, "/auth/login");
    }

    #[test]
    fn test_partial_override() {
        let settings: HubSettings = serde_json::from_str(r#"{"welcome_bonus": 7}"#).unwrap();
        assert_eq!(settings.welcome_bonus, 7);
        assert_eq!(settings.referrer_bonus, 10);
    }
}
