//! Ledger persistence layer
//!
//! Saves and loads the whole ledger as one JSON document.

use crate::core::model::{AccountId, DerivedAddress, LockedUtxo, TransactionRecord, Utxo};
use crate::ledger::LedgerError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Every ledger row, as written to disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    #[serde(default)]
    pub utxos: Vec<Utxo>,
    #[serde(default)]
    pub locks: Vec<LockedUtxo>,
    #[serde(default)]
    pub transactions: Vec<TransactionRecord>,
    #[serde(default)]
    pub derived_addresses: Vec<(AccountId, DerivedAddress)>,
}

/// Write the snapshot to `path`
///
/// The document is written to a sibling temporary file first and renamed
/// over the target, so readers never see a half-written ledger.
pub fn save_snapshot(path: &Path, snapshot: &LedgerSnapshot) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    let file = fs::File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, snapshot)?;
    writer.flush()?;

    // Atomic rename
    fs::rename(&temp_path, path)?;
    log::debug!("Saved ledger to {}", path.display());
    Ok(())
}

/// Load a snapshot written by [`save_snapshot`]
pub fn load_snapshot(path: &Path) -> Result<LedgerSnapshot, LedgerError> {
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let snapshot: LedgerSnapshot = serde_json::from_reader(reader)?;
    log::debug!(
        "Loaded ledger from {}: {} utxos, {} locks, {} transactions",
        path.display(),
        snapshot.utxos.len(),
        snapshot.locks.len(),
        snapshot.transactions.len()
    );
    Ok(snapshot)
}
