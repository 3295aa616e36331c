//! Tunables for a settlement run.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};
use thiserror::Error;

use crate::util::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse settlement config")]
    Parse(#[from] serde_json::Error),
    #[error("`{field}` must be non-zero")]
    Zero { field: &'static str },
}

#[serde_as]
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Keys per remote read
    pub page_size: usize,
    /// Tickets per progress report and per settlement work unit
    pub chunk_size: usize,
    /// Pages read concurrently
    pub fetch_concurrency: usize,
    pub fetch_retry: RetryPolicy,
    /// Applies to every individual write: refund, punch, participation
    /// mint, bitmap range
    pub write_retry: RetryPolicy,
    /// Bytes per bitmap write
    pub bitmap_write_width: usize,
    pub bitmap_write_concurrency: usize,
    /// Settlement chunks processed concurrently
    pub settlement_concurrency: usize,
    /// Seed for the lottery draw. Fresh OS entropy is used when unset.
    #[serde_as(as = "Option<Hex>")]
    pub lottery_seed: Option<[u8; 32]>,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            chunk_size: 1000,
            fetch_concurrency: 100,
            fetch_retry: RetryPolicy::fixed(3, Duration::from_secs(10)),
            write_retry: RetryPolicy::fixed(3, Duration::from_secs(1)),
            bitmap_write_width: 10,
            bitmap_write_concurrency: 100,
            settlement_concurrency: 16,
            lottery_seed: None,
        }
    }
}

impl SettlementConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("page_size", self.page_size),
            ("chunk_size", self.chunk_size),
            ("fetch_concurrency", self.fetch_concurrency),
            ("fetch_retry.max_attempts", self.fetch_retry.max_attempts as usize),
            ("write_retry.max_attempts", self.write_retry.max_attempts as usize),
            ("bitmap_write_width", self.bitmap_write_width),
            ("bitmap_write_concurrency", self.bitmap_write_concurrency),
            ("settlement_concurrency", self.settlement_concurrency),
        ];
        match fields.into_iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(ConfigError::Zero { field }),
            None => Ok(()),
        }
    }
}
