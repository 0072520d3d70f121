//! Operation-boundary errors

use crate::core::fee::Shortfall;
use crate::core::script::ScriptError;
use crate::core::transaction::TransactionError;
use crate::crypto::KeyError;
use crate::engine::collaborators::{KeyStoreError, OracleError};
use crate::engine::config::ConfigError;
use crate::ledger::LedgerError;
use thiserror::Error;

/// Result type returned by every engine operation
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced to engine callers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Insufficient funds: need {required} sats, have {available}")]
    InsufficientFunds { required: u64, available: u64 },
    #[error("Invalid amount")]
    InvalidAmount,
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("Lock is not spendable for another {blocks_remaining} blocks")]
    LockNotSpendable { blocks_remaining: u32 },
    #[error("Broadcast failed: {cause}")]
    BroadcastFailed { cause: String },
    #[error("Database error: {cause}")]
    DatabaseError { cause: String },
    #[error("Wallet is locked")]
    WalletLocked,
    #[error("Key store error: {0}")]
    KeyStore(String),
    #[error("Chain oracle error: {0}")]
    Oracle(String),
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<LedgerError> for EngineError {
    fn from(e: LedgerError) -> Self {
        EngineError::DatabaseError {
            cause: e.to_string(),
        }
    }
}

impl From<Shortfall> for EngineError {
    fn from(s: Shortfall) -> Self {
        EngineError::InsufficientFunds {
            required: s.required,
            available: s.available,
        }
    }
}

impl From<TransactionError> for EngineError {
    fn from(e: TransactionError) -> Self {
        match e {
            TransactionError::InsufficientFunds {
                required,
                available,
            } => EngineError::InsufficientFunds {
                required,
                available,
            },
            TransactionError::InvalidAmount => EngineError::InvalidAmount,
            TransactionError::LockNotSpendable { blocks_remaining } => {
                EngineError::LockNotSpendable { blocks_remaining }
            }
            TransactionError::NoValidSequence => EngineError::Internal(e.to_string()),
            other => EngineError::InvalidParams(other.to_string()),
        }
    }
}

impl From<KeyError> for EngineError {
    fn from(e: KeyError) -> Self {
        EngineError::InvalidParams(e.to_string())
    }
}

impl From<ScriptError> for EngineError {
    fn from(e: ScriptError) -> Self {
        EngineError::InvalidParams(e.to_string())
    }
}

impl From<KeyStoreError> for EngineError {
    fn from(e: KeyStoreError) -> Self {
        match e {
            KeyStoreError::Locked => EngineError::WalletLocked,
            other => EngineError::KeyStore(other.to_string()),
        }
    }
}

impl From<OracleError> for EngineError {
    fn from(e: OracleError) -> Self {
        EngineError::Oracle(e.0)
    }
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::OutPoint;

    #[test]
    fn test_transaction_error_mapping() {
        let e: EngineError = TransactionError::InsufficientFunds {
            required: 10,
            available: 5,
        }
        .into();
        assert_eq!(
            e,
            EngineError::InsufficientFunds {
                required: 10,
                available: 5
            }
        );

        let e: EngineError = TransactionError::LockNotSpendable {
            blocks_remaining: 3,
        }
        .into();
        assert_eq!(e, EngineError::LockNotSpendable { blocks_remaining: 3 });

        let e: EngineError = TransactionError::KeyMismatch(OutPoint::new("aa", 0)).into();
        assert!(matches!(e, EngineError::InvalidParams(_)));
    }

    #[test]
    fn test_key_store_mapping() {
        assert_eq!(EngineError::from(KeyStoreError::Locked), EngineError::WalletLocked);
        assert!(matches!(
            EngineError::from(KeyStoreError::Missing("ordinals".to_string())),
            EngineError::KeyStore(_)
        ));
    }

    #[test]
    fn test_timeout_message() {
        let e = EngineError::Timeout {
            operation: "broadcast",
            seconds: 30,
        };
        assert_eq!(e.to_string(), "broadcast timed out after 30s");
    }
}
