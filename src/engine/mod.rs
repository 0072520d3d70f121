//! Wallet engine
//!
//! This module ties the core building blocks to the outside world:
//! - Collaborator traits (key store, broadcaster, chain and fee oracles)
//! - Operation-boundary errors and configuration
//! - Session state and the spend guard
//! - The broadcast saga and the wallet operations built on it

pub mod collaborators;
pub mod config;
pub mod error;
pub mod guard;
pub mod saga;
pub mod state;
pub mod wallet;

#[cfg(test)]
pub(crate) mod mocks;

pub use collaborators::{
    BroadcastError, Broadcaster, ChainOracle, FeeOracle, KeyRole, KeyStore, KeyStoreError,
    OracleError,
};
pub use config::{ConfigError, EngineConfig};
pub use error::{EngineError, EngineResult};
pub use guard::{SpendGuard, SpendPermit};
pub use saga::{BroadcastSaga, SagaOutcome, SpendPlan};
pub use state::EngineState;
pub use wallet::{Collaborators, SpendReceipt, SweepReport, WalletEngine, LOCK_TAG};
