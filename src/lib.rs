//! Sats-Engine: a UTXO wallet engine for BSV
//!
//! This crate provides the transaction side of a single-wallet engine:
//! - Fee model and greedy coin selection with change planning
//! - Counterparty key derivation for receiving addresses
//! - Multi-key P2PKH transaction building and FORKID signing
//! - OP_PUSH_TX timelock scripts and their unlock transactions
//! - A broadcast saga keeping the local ledger consistent with the network
//! - A spend guard serializing every operation that selects outputs
//!
//! # Example
//!
//! ```rust
//! use sats_engine::core::{calculate_tx_fee, create_timelock_script, parse_timelock_bytes, FeeRate};
//! use sats_engine::crypto::KeyPair;
//!
//! // One input paying one recipient plus change at 0.1 sat/byte
//! assert_eq!(calculate_tx_fee(1, 2, 0, FeeRate(100)), 23);
//!
//! // Lock script for a fresh key, and back
//! let key = KeyPair::generate();
//! let script = create_timelock_script(&key.public_key_hash(), 900_000).unwrap();
//! let params = parse_timelock_bytes(&script).unwrap();
//! assert_eq!(params.unlock_block, 900_000);
//! ```

pub mod cli;
pub mod core;
pub mod crypto;
pub mod engine;
pub mod ledger;

// Re-export commonly used types
pub use core::{
    FeeRate, LockedUtxo, OutPoint, SignedTransaction, TransactionBuilder, TransactionRecord, Utxo,
};
pub use crypto::{KeyPair, SigningStrategy};
pub use engine::{
    Collaborators, EngineConfig, EngineError, EngineResult, SpendReceipt, WalletEngine,
};
pub use ledger::{LedgerStore, MemoryLedger};
