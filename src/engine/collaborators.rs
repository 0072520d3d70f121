//! External collaborators
//!
//! The engine never owns keys, network access or chain data. It reaches
//! them through these traits, each call bounded by a timeout.

use crate::core::fee::FeeRate;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

// =============================================================================
// Key Store
// =============================================================================

/// Which wallet key an operation needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRole {
    /// Pays and receives ordinary funds; also owns locks
    Wallet,
    Ordinals,
    /// Root of counterparty-derived receiving addresses
    Identity,
}

impl fmt::Display for KeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyRole::Wallet => f.write_str("wallet"),
            KeyRole::Ordinals => f.write_str("ordinals"),
            KeyRole::Identity => f.write_str("identity"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyStoreError {
    #[error("wallet is locked")]
    Locked,
    #[error("no {0} key stored")]
    Missing(String),
    #[error("{0}")]
    Other(String),
}

/// Hands out signing keys while the wallet is unlocked
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// WIF for `role`; `operation` names the caller for auditing
    async fn signing_key(
        &self,
        role: KeyRole,
        operation: &str,
    ) -> Result<Zeroizing<String>, KeyStoreError>;
}

// =============================================================================
// Broadcaster
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// The network refused the transaction; it will never confirm as sent
    #[error("rejected: {0}")]
    Rejected(String),
    /// The network already has this transaction or a conflicting one
    #[error("already known: {0}")]
    AlreadyKnown(String),
    /// No definitive answer (connection dropped, gateway error, timeout)
    #[error("transport error: {0}")]
    Transport(String),
}

impl BroadcastError {
    /// Whether the transaction may have reached the network anyway
    pub fn is_ambiguous(&self) -> bool {
        !matches!(self, BroadcastError::Rejected(_))
    }
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Submit a raw transaction; returns the txid the network reports
    async fn broadcast(&self, raw_hex: &str, txid: &str) -> Result<String, BroadcastError>;
}

// =============================================================================
// Oracles
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("oracle unavailable: {0}")]
pub struct OracleError(pub String);

#[async_trait]
pub trait ChainOracle: Send + Sync {
    async fn block_height(&self) -> Result<u32, OracleError>;

    /// Txid of the transaction spending `(txid, vout)`, if any
    async fn output_spent_by(&self, txid: &str, vout: u32) -> Result<Option<String>, OracleError>;
}

#[async_trait]
pub trait FeeOracle: Send + Sync {
    async fn quote_fee_rate(&self) -> Result<FeeRate, OracleError>;
}
