//! Engine configuration
//!
//! Loaded from an optional JSON file; missing fields take their defaults.

use crate::core::fee::{
    FeeRate, DEFAULT_FEE_QUOTE_TTL, DEFAULT_FEE_RATE, MAX_FEE_RATE, MIN_FEE_RATE,
};
use crate::core::model::AccountId;
use crate::core::selection::DEFAULT_SELECTION_BUFFER;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Shortest timeout allowed for a collaborator call
pub const MIN_TIMEOUT_SECS: u64 = 5;

/// Longest timeout allowed for a collaborator call
pub const MAX_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fee rate used when no override or fresh quote exists (sat/kB)
    pub default_fee_rate: u64,
    pub min_fee_rate: u64,
    pub max_fee_rate: u64,
    pub fee_quote_ttl_secs: u64,
    /// Broadcast timeout
    pub network_timeout_secs: u64,
    /// Fee quote, block height and spent-output queries
    pub oracle_timeout_secs: u64,
    pub key_store_timeout_secs: u64,
    /// Age after which an unresolved pending UTXO is rolled back
    pub pending_sweep_after_secs: u64,
    pub selection_buffer_sats: u64,
    pub account_id: AccountId,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_fee_rate: DEFAULT_FEE_RATE.as_sat_per_kb(),
            min_fee_rate: MIN_FEE_RATE.as_sat_per_kb(),
            max_fee_rate: MAX_FEE_RATE.as_sat_per_kb(),
            fee_quote_ttl_secs: DEFAULT_FEE_QUOTE_TTL.as_secs(),
            network_timeout_secs: 30,
            oracle_timeout_secs: 10,
            key_store_timeout_secs: 5,
            pending_sweep_after_secs: 600,
            selection_buffer_sats: DEFAULT_SELECTION_BUFFER,
            account_id: 1,
        }
    }
}

impl EngineConfig {
    /// Load from `path`, using defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let data = fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            log::info!("No config at {}, using defaults", path.display());
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_fee_rate == 0 {
            return Err(ConfigError::Invalid("min_fee_rate must be positive".into()));
        }
        if !(self.min_fee_rate <= self.default_fee_rate && self.default_fee_rate <= self.max_fee_rate)
        {
            return Err(ConfigError::Invalid(format!(
                "fee rates must satisfy min <= default <= max, got {} / {} / {}",
                self.min_fee_rate, self.default_fee_rate, self.max_fee_rate
            )));
        }
        for (name, secs) in [
            ("network_timeout_secs", self.network_timeout_secs),
            ("oracle_timeout_secs", self.oracle_timeout_secs),
            ("key_store_timeout_secs", self.key_store_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    pub fn default_fee_rate(&self) -> FeeRate {
        FeeRate(self.default_fee_rate)
    }

    /// Restrict a user or network rate to the configured bounds
    pub fn clamp_fee_rate(&self, rate: FeeRate) -> FeeRate {
        rate.clamp_to(FeeRate(self.min_fee_rate), FeeRate(self.max_fee_rate))
    }

    pub fn fee_quote_ttl(&self) -> Duration {
        Duration::from_secs(self.fee_quote_ttl_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        clamp_timeout(self.network_timeout_secs)
    }

    pub fn oracle_timeout(&self) -> Duration {
        clamp_timeout(self.oracle_timeout_secs)
    }

    pub fn key_store_timeout(&self) -> Duration {
        clamp_timeout(self.key_store_timeout_secs)
    }

    pub fn pending_sweep_after(&self) -> Duration {
        Duration::from_secs(self.pending_sweep_after_secs)
    }
}

fn clamp_timeout(secs: u64) -> Duration {
    Duration::from_secs(secs.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_fee_rate(), FeeRate(100));
        assert_eq!(config.selection_buffer_sats, 100);
    }

    #[test]
    fn test_timeouts_are_clamped() {
        let config = EngineConfig {
            network_timeout_secs: 600,
            key_store_timeout_secs: 1,
            ..Default::default()
        };
        assert_eq!(config.network_timeout(), Duration::from_secs(30));
        assert_eq!(config.key_store_timeout(), Duration::from_secs(5));
        assert_eq!(config.oracle_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_fee_bounds() {
        let config = EngineConfig {
            default_fee_rate: 5_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert_eq!(
            EngineConfig::default().clamp_fee_rate(FeeRate(5_000)),
            FeeRate(1_000)
        );
    }

    #[test]
    fn test_load_partial_and_missing() {
        let dir = tempdir().unwrap();
        let missing = EngineConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(missing, EngineConfig::default());

        let path = dir.path().join("engine.json");
        fs::write(&path, r#"{ "default_fee_rate": 50, "account_id": 3 }"#).unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.default_fee_rate, 50);
        assert_eq!(config.account_id, 3);
        assert_eq!(config.max_fee_rate, 1_000);

        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);

        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            EngineConfig::load(&path),
            Err(ConfigError::ParseError(_))
        ));
    }
}
