//! CLI commands for the wallet engine
//!
//! Offline tools: fee estimates, timelock scripts, key and address
//! utilities, and inspection of a JSON ledger file.

use crate::core::fee::{
    calculate_lock_fee, calculate_tx_fee, calculate_unlock_fee, estimate_tx_size, output_bytes,
    FeeRate,
};
use crate::core::model::{AccountId, SpendingStatus};
use crate::core::script::op_return_script;
use crate::core::timelock::{create_timelock_script, parse_timelock_script};
use crate::crypto::{
    address_to_pubkey_hash, derive_child_address, public_key_from_hex, pubkey_hash_to_address,
    KeyPair,
};
use crate::engine::{EngineConfig, LOCK_TAG};
use crate::ledger::MemoryLedger;
use std::path::Path;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn short(txid: &str) -> &str {
    txid.get(..16).unwrap_or(txid)
}

/// Fee for a P2PKH transaction
pub fn cmd_fee(inputs: usize, outputs: usize, extra_bytes: u64, rate: FeeRate) -> CliResult<()> {
    let size = estimate_tx_size(inputs, outputs, extra_bytes);
    let fee = calculate_tx_fee(inputs, outputs, extra_bytes, rate);

    println!("💸 Fee estimate at {}", rate);
    println!("   ├─ Inputs: {}", inputs);
    println!("   ├─ Outputs: {}", outputs);
    println!("   ├─ Size: {} bytes", size);
    println!("   └─ Fee: {} sats", fee);

    Ok(())
}

/// Fees to lock funds to `address` and later unlock them
pub fn cmd_lock_fee(
    inputs: usize,
    address: &str,
    unlock_block: u32,
    origin: Option<&str>,
    rate: FeeRate,
) -> CliResult<()> {
    let script = create_timelock_script(&address_to_pubkey_hash(address)?, unlock_block)?;
    let tag_bytes = origin
        .map(|o| output_bytes(op_return_script(&[LOCK_TAG, o.as_bytes()]).len()))
        .unwrap_or(0);

    println!("🔒 Lock fees at {}", rate);
    println!("   ├─ Timelock script: {} bytes", script.len());
    println!(
        "   ├─ Lock fee: {} sats",
        calculate_lock_fee(inputs, script.len(), tag_bytes, rate)
    );
    println!(
        "   └─ Unlock fee: {} sats",
        calculate_unlock_fee(script.len(), rate)
    );

    Ok(())
}

/// Print the timelock locking script for `address`
pub fn cmd_lock_script_build(address: &str, unlock_block: u32) -> CliResult<()> {
    let script = create_timelock_script(&address_to_pubkey_hash(address)?, unlock_block)?;

    println!("🔒 Timelock script ({} bytes)", script.len());
    println!("   Unlocks at block: {}", unlock_block);
    println!("{}", hex::encode(script));

    Ok(())
}

/// Decode a timelock locking script
pub fn cmd_lock_script_parse(script_hex: &str) -> CliResult<()> {
    match parse_timelock_script(script_hex.trim()) {
        Some(params) => {
            println!("🔓 Timelock script");
            println!("   ├─ Unlock block: {}", params.unlock_block);
            println!("   ├─ Pubkey hash: {}", hex::encode(params.pubkey_hash));
            println!(
                "   └─ Address: {}",
                pubkey_hash_to_address(&params.pubkey_hash)
            );
        }
        None => println!("❌ Not a timelock script"),
    }
    Ok(())
}

/// Receiving address for a counterparty invoice
pub fn cmd_derive(identity_wif: &str, sender_pubkey: &str, invoice: &str) -> CliResult<()> {
    let identity = KeyPair::from_wif(identity_wif)?;
    let counterparty = public_key_from_hex(sender_pubkey)?;
    let address = derive_child_address(&identity.secret_key, &counterparty, invoice)?;

    println!("🔑 Derived address");
    println!("   ├─ Counterparty: {}", sender_pubkey);
    println!("   ├─ Invoice: {}", invoice);
    println!("   └─ Address: {}", address);

    Ok(())
}

/// Address and public key for a WIF, or a fresh key when none is given
pub fn cmd_address(wif: Option<&str>) -> CliResult<()> {
    let keypair = match wif {
        Some(wif) => KeyPair::from_wif(wif)?,
        None => {
            let keypair = KeyPair::generate();
            println!("🔐 New key generated");
            println!("   WIF: {}", keypair.to_wif());
            keypair
        }
    };

    println!("📍 Address: {}", keypair.address());
    println!("   Public key: {}", keypair.public_key_hex());

    Ok(())
}

/// Print the effective engine configuration
pub fn cmd_config(path: &Path) -> CliResult<()> {
    let config = EngineConfig::load(path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Spendable balance in a ledger file
pub async fn cmd_ledger_balance(path: &Path, account: AccountId) -> CliResult<()> {
    let ledger = MemoryLedger::load_from_file(path)?;
    let utxos = ledger.utxos(account).await;
    let pending = utxos
        .iter()
        .filter(|u| matches!(u.spending_status, SpendingStatus::Pending(_)))
        .count();
    let locked: u64 = ledger
        .locks(account)
        .await
        .iter()
        .filter(|l| !l.unlocked)
        .map(|l| l.utxo.satoshis)
        .sum();

    println!("💰 Account {}", account);
    println!("   ├─ Spendable: {} sats", ledger.balance(account).await);
    println!("   ├─ Locked: {} sats", locked);
    println!("   └─ Pending outputs: {}", pending);

    Ok(())
}

/// List UTXOs in a ledger file
pub async fn cmd_ledger_utxos(path: &Path, account: AccountId) -> CliResult<()> {
    let ledger = MemoryLedger::load_from_file(path)?;
    let utxos = ledger.utxos(account).await;

    if utxos.is_empty() {
        println!("📭 No UTXOs for account {}", account);
        return Ok(());
    }

    println!("📋 UTXOs:");
    for utxo in &utxos {
        println!(
            "   └─ {}:{} = {} sats [{:?}, {}]",
            short(&utxo.txid),
            utxo.vout,
            utxo.satoshis,
            utxo.basket,
            utxo.spending_status
        );
    }

    Ok(())
}

/// List locks in a ledger file
pub async fn cmd_ledger_locks(path: &Path, account: AccountId) -> CliResult<()> {
    let ledger = MemoryLedger::load_from_file(path)?;
    let locks = ledger.locks(account).await;

    if locks.is_empty() {
        println!("📭 No locks for account {}", account);
        return Ok(());
    }

    println!("🔒 Locks:");
    for lock in &locks {
        let state = if lock.unlocked { "unlocked" } else { "active" };
        println!(
            "   └─ {}:{} = {} sats until block {} ({})",
            short(&lock.utxo.txid),
            lock.utxo.vout,
            lock.utxo.satoshis,
            lock.unlock_block,
            state
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Basket, Utxo};
    use crate::ledger::LedgerStore;
    use tempfile::tempdir;

    #[test]
    fn test_offline_commands() {
        let kp = KeyPair::generate();
        assert!(cmd_fee(1, 2, 0, FeeRate(100)).is_ok());
        assert!(cmd_lock_fee(1, &kp.address(), 900_000, Some("origin_0"), FeeRate(100)).is_ok());
        assert!(cmd_lock_script_build(&kp.address(), 900_000).is_ok());
        assert!(cmd_lock_script_build("bogus", 900_000).is_err());
        assert!(cmd_lock_script_parse("00").is_ok());
        assert!(cmd_address(Some(kp.to_wif().as_str())).is_ok());
        assert!(cmd_address(Some("not-a-wif")).is_err());
    }

    #[tokio::test]
    async fn test_ledger_commands() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let ledger = MemoryLedger::new();
        ledger
            .insert_utxo(
                Utxo {
                    txid: "ab".repeat(32),
                    vout: 0,
                    satoshis: 1_000,
                    locking_script_hex: String::new(),
                    owning_address: String::new(),
                    basket: Basket::Default,
                    spendable: true,
                    spending_status: SpendingStatus::None,
                    account_id: 1,
                },
                1,
            )
            .await
            .unwrap();
        ledger.save_to_file(&path).await.unwrap();

        assert!(cmd_ledger_balance(&path, 1).await.is_ok());
        assert!(cmd_ledger_utxos(&path, 1).await.is_ok());
        assert!(cmd_ledger_locks(&path, 1).await.is_ok());
        assert!(cmd_ledger_utxos(&dir.path().join("missing.json"), 1)
            .await
            .is_err());
    }
}
