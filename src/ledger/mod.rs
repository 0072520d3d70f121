//! Local ledger storage
//!
//! The ledger owns every UTXO, lock and transaction row. The engine talks to
//! it through [`LedgerStore`]; [`MemoryLedger`] is the bundled
//! implementation, optionally persisted to a JSON file.

pub mod memory;
pub mod persistence;

use crate::core::model::{
    AccountId, Basket, DerivedAddress, LockedUtxo, OutPoint, TransactionRecord, Utxo,
};
use async_trait::async_trait;
use thiserror::Error;

pub use memory::{FaultPoint, MemoryLedger};
pub use persistence::{load_snapshot, save_snapshot, LedgerSnapshot};

/// Ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("UTXO not found: {0}")]
    NotFound(OutPoint),
    #[error("UTXO {outpoint} is already {status}")]
    AlreadyClaimed { outpoint: OutPoint, status: String },
    #[error("Lock not found: {0}")]
    LockNotFound(OutPoint),
    #[error("Storage fault: {0}")]
    Storage(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One write inside an all-or-nothing batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerOp {
    /// Insert, or merge into the existing record with the same txid
    RecordTransaction(TransactionRecord),
    ConfirmSpent {
        outpoints: Vec<OutPoint>,
        txid: String,
    },
    /// No-op when the outpoint already exists
    InsertUtxo(Utxo),
    /// Inserts the backing UTXO too
    InsertLock(LockedUtxo),
    MarkLockUnlocked(OutPoint),
}

/// Persistence contract consumed by the engine
///
/// Every call is scoped to one account. `mark_pending` and `run_atomic`
/// are all-or-nothing.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Unclaimed, signature-spendable UTXOs of a basket in insertion order
    async fn select_spendable_utxos(
        &self,
        basket: Basket,
        account_id: AccountId,
    ) -> Result<Vec<Utxo>, LedgerError>;

    /// UTXOs currently claimed by an in-flight transaction
    async fn pending_utxos(&self, account_id: AccountId) -> Result<Vec<Utxo>, LedgerError>;

    /// Locks not yet marked unlocked
    async fn active_locks(&self, account_id: AccountId) -> Result<Vec<LockedUtxo>, LedgerError>;

    async fn derived_addresses(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<DerivedAddress>, LedgerError>;

    /// Store a derived address; existing addresses are left untouched
    async fn insert_derived_address(
        &self,
        row: DerivedAddress,
        account_id: AccountId,
    ) -> Result<(), LedgerError>;

    async fn transaction(
        &self,
        txid: &str,
        account_id: AccountId,
    ) -> Result<Option<TransactionRecord>, LedgerError>;

    /// Claim every key for `txid`; fails without changes if any is missing or claimed
    async fn mark_pending(
        &self,
        keys: &[OutPoint],
        txid: &str,
        account_id: AccountId,
    ) -> Result<(), LedgerError>;

    async fn confirm_spent(
        &self,
        keys: &[OutPoint],
        txid: &str,
        account_id: AccountId,
    ) -> Result<(), LedgerError>;

    /// Return pending keys to spendable; keys in any other state are skipped
    async fn rollback_pending(
        &self,
        keys: &[OutPoint],
        account_id: AccountId,
    ) -> Result<(), LedgerError>;

    async fn insert_utxo(&self, row: Utxo, account_id: AccountId) -> Result<OutPoint, LedgerError>;

    async fn insert_lock(&self, row: LockedUtxo, account_id: AccountId) -> Result<(), LedgerError>;

    async fn mark_lock_unlocked(
        &self,
        outpoint: &OutPoint,
        account_id: AccountId,
    ) -> Result<(), LedgerError>;

    async fn record_transaction(
        &self,
        row: TransactionRecord,
        account_id: AccountId,
    ) -> Result<(), LedgerError>;

    /// Apply every op or none
    async fn run_atomic(&self, ops: Vec<LedgerOp>, account_id: AccountId)
        -> Result<(), LedgerError>;
}
