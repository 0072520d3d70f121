//! Core transaction components
//!
//! This module contains the pure building blocks of the engine:
//! - Ledger row types (UTXOs, locks, derived addresses, records)
//! - Fee model and change planning
//! - Coin selection
//! - Script primitives (P2PKH, OP_RETURN, script numbers)
//! - Transactions (serialization, FORKID sighash, multi-key builder)
//! - Timelock script build/parse and the unlock transaction

pub mod fee;
pub mod model;
pub mod script;
pub mod selection;
pub mod timelock;
pub mod transaction;

pub use fee::{
    calculate_exact_fee, calculate_lock_fee, calculate_max_send, calculate_tx_fee,
    calculate_unlock_fee, fee_from_bytes, plan_change, ChangePlan, ExactFee, FeeRate,
    FeeRateCache, MaxSend, Shortfall, AVG_INPUT_BYTES, AVG_OUTPUT_BYTES, BASE_TX_BYTES,
    DEFAULT_FEE_RATE, MAX_FEE_RATE, MIN_FEE_RATE,
};
pub use model::{
    AccountId, Basket, DerivedAddress, LockedUtxo, OutPoint, SpendingStatus, TransactionRecord,
    TxStatus, Utxo,
};
pub use script::{
    locking_script_for_address, op_return_script, p2pkh_locking_script, ScriptBuilder,
    ScriptError, SIGHASH_ALL_FORKID,
};
pub use selection::{
    dedupe_utxos, select_coins, unique_utxos, CoinSelection, DEFAULT_SELECTION_BUFFER,
};
pub use timelock::{
    build_unlock_transaction, create_timelock_script, create_timelock_script_hex,
    is_timelock_script, parse_timelock_bytes, parse_timelock_script, TimelockParams,
};
pub use transaction::{
    build_consolidation, SignedTransaction, SigningInput, Transaction, TransactionBuilder,
    TransactionError, TxInput, TxOutput, LOCKTIME_THRESHOLD, MAX_SATOSHIS, SEQUENCE_FINAL,
    TX_VERSION,
};
