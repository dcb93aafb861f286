//! Tunables for the session-sync engine.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_MAX_SYNC_RETRIES: u32 = 2;
pub const DEFAULT_DELIVERY_DELAY_MS: u64 = 350;
pub const DEFAULT_DEDUP_CAP: usize = 5_000;
pub const DEFAULT_MAX_MESSAGES_PER_SYNC: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Runtime configuration for [`crate::SessionSyncService`].
pub struct SessionSyncConfig {
    pub retry_interval_ms: u64,
    pub max_sync_retries: u32,
    pub delivery_delay_ms: u64,
    pub dedup_cap: usize,
    pub max_messages_per_sync: usize,
    pub message_chunk_chars: usize,
    pub embed_chunk_chars: usize,
    pub thread_name_max_chars: usize,
    pub delivery_lane_idle_ms: u64,
}

impl Default for SessionSyncConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            max_sync_retries: DEFAULT_MAX_SYNC_RETRIES,
            delivery_delay_ms: DEFAULT_DELIVERY_DELAY_MS,
            dedup_cap: DEFAULT_DEDUP_CAP,
            max_messages_per_sync: DEFAULT_MAX_MESSAGES_PER_SYNC,
            message_chunk_chars: 1_900,
            embed_chunk_chars: 3_900,
            thread_name_max_chars: 100,
            delivery_lane_idle_ms: 60_000,
        }
    }
}

impl SessionSyncConfig {
    /// Parses a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config = toml::from_str::<Self>(raw).context("failed to parse session sync config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_interval_ms == 0 {
            bail!("session sync retry_interval_ms must be greater than 0");
        }
        if self.dedup_cap == 0 {
            bail!("session sync dedup_cap must be greater than 0");
        }
        if self.max_messages_per_sync == 0 {
            bail!("session sync max_messages_per_sync must be greater than 0");
        }
        if self.message_chunk_chars == 0 || self.embed_chunk_chars == 0 {
            bail!("session sync chunk limits must be greater than 0");
        }
        if self.thread_name_max_chars == 0 {
            bail!("session sync thread_name_max_chars must be greater than 0");
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn delivery_delay(&self) -> Duration {
        Duration::from_millis(self.delivery_delay_ms)
    }

    pub fn delivery_lane_idle(&self) -> Duration {
        Duration::from_millis(self.delivery_lane_idle_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::SessionSyncConfig;

    #[test]
    fn unit_default_config_matches_documented_policy() {
        let config = SessionSyncConfig::default();
        assert_eq!(config.retry_interval_ms, 15_000);
        assert_eq!(config.max_sync_retries, 2);
        assert_eq!(config.delivery_delay_ms, 350);
        assert_eq!(config.dedup_cap, 5_000);
        assert_eq!(config.max_messages_per_sync, 200);
        config.validate().expect("defaults validate");
    }

    #[test]
    fn functional_from_toml_str_overrides_selected_keys() {
        let config = SessionSyncConfig::from_toml_str(
            "retry_interval_ms = 500\nmax_messages_per_sync = 20\n",
        )
        .expect("parse");
        assert_eq!(config.retry_interval_ms, 500);
        assert_eq!(config.max_messages_per_sync, 20);
        assert_eq!(config.dedup_cap, 5_000);
    }

    #[test]
    fn regression_from_toml_str_rejects_zero_dedup_cap() {
        let error = SessionSyncConfig::from_toml_str("dedup_cap = 0").expect_err("invalid");
        assert!(error.to_string().contains("dedup_cap"));
    }
}
