//! Ledger row types
//!
//! UTXOs, time-locked outputs, counterparty-derived receiving addresses and
//! transaction records, exactly as the ledger store persists them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Account scope of every ledger row
pub type AccountId = u32;

// =============================================================================
// Outpoint
// =============================================================================

/// Reference to a transaction output: `(txid, vout)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: String,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: &str, vout: u32) -> Self {
        Self {
            txid: txid.to_string(),
            vout,
        }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

// =============================================================================
// UTXO
// =============================================================================

/// Purpose tag grouping UTXOs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Basket {
    Default,
    Locked,
    Identity,
    Derived,
}

impl Basket {
    /// Whether outputs in this basket can be spent by a plain signature
    pub fn is_spendable(&self) -> bool {
        !matches!(self, Basket::Locked)
    }
}

/// Where a UTXO stands in the spend lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpendingStatus {
    #[default]
    None,
    /// Selected by an in-flight transaction that has not settled yet
    Pending(String),
    /// Spent by the given transaction
    Confirmed(String),
}

impl fmt::Display for SpendingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpendingStatus::None => f.write_str("none"),
            SpendingStatus::Pending(txid) => write!(f, "pending:{}", txid),
            SpendingStatus::Confirmed(txid) => write!(f, "confirmed:{}", txid),
        }
    }
}

/// An output the wallet can spend or track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub satoshis: u64,
    pub locking_script_hex: String,
    pub owning_address: String,
    pub basket: Basket,
    pub spendable: bool,
    #[serde(default)]
    pub spending_status: SpendingStatus,
    pub account_id: AccountId,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(&self.txid, self.vout)
    }

    /// Spendable by signature and not claimed by any transaction
    pub fn is_available(&self) -> bool {
        self.spendable && self.spending_status == SpendingStatus::None
    }
}

// =============================================================================
// Locked UTXO
// =============================================================================

/// A UTXO held by the timelock script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedUtxo {
    pub utxo: Utxo,
    /// Height from which the unlock transaction is valid
    pub unlock_block: u32,
    /// Height at which the lock confirmed (may be an estimate)
    pub lock_block: u32,
    pub public_key_hex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal_origin: Option<String>,
    #[serde(default)]
    pub unlocked: bool,
}

impl LockedUtxo {
    pub fn outpoint(&self) -> OutPoint {
        self.utxo.outpoint()
    }

    /// Blocks left until the output can be unlocked (0 when mature)
    pub fn blocks_remaining(&self, current_height: u32) -> u32 {
        self.unlock_block.saturating_sub(current_height)
    }
}

// =============================================================================
// Derived Address
// =============================================================================

/// Receiving address whose key is recomputed from the identity key on demand
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedAddress {
    pub address: String,
    pub sender_pubkey: String,
    pub invoice_number: String,
    /// WIF persisted by older wallet versions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_private_key: Option<String>,
}

impl fmt::Debug for DerivedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedAddress")
            .field("address", &self.address)
            .field("sender_pubkey", &self.sender_pubkey)
            .field("invoice_number", &self.invoice_number)
            .field("legacy_private_key", &self.legacy_private_key.is_some())
            .finish()
    }
}

// =============================================================================
// Transaction Record
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    /// Broadcast by this wallet
    Broadcast,
    /// Seen on chain without our raw transaction (sync, sweeps)
    Observed,
    Confirmed,
}

/// History entry for one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub txid: String,
    /// Empty when the transaction was observed rather than built here
    #[serde(default)]
    pub raw_hex: String,
    pub description: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Net effect on the wallet; negative = outgoing including fee
    pub amount: i64,
    pub account_id: AccountId,
    pub status: TxStatus,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(txid: &str, raw_hex: &str, description: &str, amount: i64) -> Self {
        Self {
            txid: txid.to_string(),
            raw_hex: raw_hex.to_string(),
            description: description.to_string(),
            labels: BTreeSet::new(),
            amount,
            account_id: 0,
            status: TxStatus::Broadcast,
            created_at: Utc::now(),
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.labels.insert(label.to_string());
        self
    }

    /// Fold newer information for the same txid into this record
    pub fn merge(&mut self, newer: TransactionRecord) {
        self.labels.extend(newer.labels);
        if !newer.description.is_empty() {
            self.description = newer.description;
        }
        if self.raw_hex.is_empty() && !newer.raw_hex.is_empty() {
            self.raw_hex = newer.raw_hex;
        }
        if newer.status == TxStatus::Confirmed {
            self.status = TxStatus::Confirmed;
        }
    }
}
