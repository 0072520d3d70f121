//! In-memory ledger store
//!
//! All rows live behind one `tokio` RwLock. Batches run against a copy of
//! the rows and replace them only when every op succeeds.

use crate::core::model::{
    AccountId, Basket, DerivedAddress, LockedUtxo, OutPoint, SpendingStatus, TransactionRecord,
    Utxo,
};
use crate::ledger::persistence::{load_snapshot, save_snapshot, LedgerSnapshot};
use crate::ledger::{LedgerError, LedgerOp, LedgerStore};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::RwLock;

/// Operations that can be told to fail once, for exercising recovery paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    MarkPending,
    ConfirmSpent,
    RollbackPending,
    RunAtomic,
}

// =============================================================================
// Row Operations
// =============================================================================

impl LedgerSnapshot {
    fn utxo_mut(&mut self, outpoint: &OutPoint, account_id: AccountId) -> Option<&mut Utxo> {
        self.utxos.iter_mut().find(|u| {
            u.account_id == account_id && u.vout == outpoint.vout && u.txid == outpoint.txid
        })
    }

    fn has_utxo(&self, outpoint: &OutPoint, account_id: AccountId) -> bool {
        self.utxos.iter().any(|u| {
            u.account_id == account_id && u.vout == outpoint.vout && u.txid == outpoint.txid
        })
    }

    fn mark_pending(
        &mut self,
        keys: &[OutPoint],
        txid: &str,
        account_id: AccountId,
    ) -> Result<(), LedgerError> {
        // Check every key before touching any
        for key in keys {
            let utxo = self
                .utxo_mut(key, account_id)
                .ok_or_else(|| LedgerError::NotFound(key.clone()))?;
            if utxo.spending_status != SpendingStatus::None {
                return Err(LedgerError::AlreadyClaimed {
                    outpoint: key.clone(),
                    status: utxo.spending_status.to_string(),
                });
            }
        }
        for key in keys {
            if let Some(utxo) = self.utxo_mut(key, account_id) {
                utxo.spending_status = SpendingStatus::Pending(txid.to_string());
            }
        }
        Ok(())
    }

    fn confirm_spent(
        &mut self,
        keys: &[OutPoint],
        txid: &str,
        account_id: AccountId,
    ) -> Result<(), LedgerError> {
        for key in keys {
            let utxo = self
                .utxo_mut(key, account_id)
                .ok_or_else(|| LedgerError::NotFound(key.clone()))?;
            utxo.spending_status = SpendingStatus::Confirmed(txid.to_string());
        }
        Ok(())
    }

    fn rollback_pending(&mut self, keys: &[OutPoint], account_id: AccountId) {
        for key in keys {
            if let Some(utxo) = self.utxo_mut(key, account_id) {
                if matches!(utxo.spending_status, SpendingStatus::Pending(_)) {
                    utxo.spending_status = SpendingStatus::None;
                }
            }
        }
    }

    fn insert_utxo(&mut self, mut row: Utxo, account_id: AccountId) -> OutPoint {
        let outpoint = row.outpoint();
        if !self.has_utxo(&outpoint, account_id) {
            row.account_id = account_id;
            self.utxos.push(row);
        }
        outpoint
    }

    fn insert_lock(&mut self, mut row: LockedUtxo, account_id: AccountId) {
        row.utxo.account_id = account_id;
        let outpoint = row.outpoint();
        self.insert_utxo(row.utxo.clone(), account_id);

        let exists = self
            .locks
            .iter()
            .any(|l| l.utxo.account_id == account_id && l.outpoint() == outpoint);
        if !exists {
            self.locks.push(row);
        }
    }

    /// Lock row with the backing output's current state from the UTXO table
    fn lock_view(&self, lock: &LockedUtxo) -> LockedUtxo {
        let mut view = lock.clone();
        if let Some(current) = self.utxos.iter().find(|u| {
            u.account_id == lock.utxo.account_id
                && u.vout == lock.utxo.vout
                && u.txid == lock.utxo.txid
        }) {
            view.utxo = current.clone();
        }
        view
    }

    fn mark_lock_unlocked(
        &mut self,
        outpoint: &OutPoint,
        account_id: AccountId,
    ) -> Result<(), LedgerError> {
        let lock = self
            .locks
            .iter_mut()
            .find(|l| l.utxo.account_id == account_id && l.outpoint() == *outpoint)
            .ok_or_else(|| LedgerError::LockNotFound(outpoint.clone()))?;
        lock.unlocked = true;
        Ok(())
    }

    fn record_transaction(&mut self, mut row: TransactionRecord, account_id: AccountId) {
        row.account_id = account_id;
        match self
            .transactions
            .iter_mut()
            .find(|t| t.account_id == account_id && t.txid == row.txid)
        {
            Some(existing) => existing.merge(row),
            None => self.transactions.push(row),
        }
    }

    fn apply(&mut self, op: LedgerOp, account_id: AccountId) -> Result<(), LedgerError> {
        match op {
            LedgerOp::RecordTransaction(row) => self.record_transaction(row, account_id),
            LedgerOp::ConfirmSpent { outpoints, txid } => {
                self.confirm_spent(&outpoints, &txid, account_id)?
            }
            LedgerOp::InsertUtxo(row) => {
                self.insert_utxo(row, account_id);
            }
            LedgerOp::InsertLock(row) => self.insert_lock(row, account_id),
            LedgerOp::MarkLockUnlocked(outpoint) => self.mark_lock_unlocked(&outpoint, account_id)?,
        }
        Ok(())
    }
}

// =============================================================================
// Memory Ledger
// =============================================================================

/// `LedgerStore` kept in memory, with optional JSON persistence
#[derive(Debug, Default)]
pub struct MemoryLedger {
    rows: RwLock<LedgerSnapshot>,
    faults: Mutex<HashSet<FaultPoint>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            rows: RwLock::new(snapshot),
            faults: Mutex::new(HashSet::new()),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self, LedgerError> {
        Ok(Self::from_snapshot(load_snapshot(path)?))
    }

    pub async fn save_to_file(&self, path: &Path) -> Result<(), LedgerError> {
        let rows = self.rows.read().await;
        save_snapshot(path, &rows)
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        self.rows.read().await.clone()
    }

    /// Make the next call of `point` fail with a storage fault
    pub fn fail_next(&self, point: FaultPoint) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(point);
        }
    }

    fn check_fault(&self, point: FaultPoint) -> Result<(), LedgerError> {
        let tripped = self
            .faults
            .lock()
            .map(|mut faults| faults.remove(&point))
            .unwrap_or(false);
        if tripped {
            return Err(LedgerError::Storage(format!("injected fault at {:?}", point)));
        }
        Ok(())
    }

    pub async fn utxo(&self, outpoint: &OutPoint, account_id: AccountId) -> Option<Utxo> {
        self.rows
            .read()
            .await
            .utxos
            .iter()
            .find(|u| u.account_id == account_id && u.outpoint() == *outpoint)
            .cloned()
    }

    pub async fn utxos(&self, account_id: AccountId) -> Vec<Utxo> {
        self.rows
            .read()
            .await
            .utxos
            .iter()
            .filter(|u| u.account_id == account_id)
            .cloned()
            .collect()
    }

    pub async fn locks(&self, account_id: AccountId) -> Vec<LockedUtxo> {
        let rows = self.rows.read().await;
        rows.locks
            .iter()
            .filter(|l| l.utxo.account_id == account_id)
            .map(|l| rows.lock_view(l))
            .collect()
    }

    pub async fn transactions(&self, account_id: AccountId) -> Vec<TransactionRecord> {
        self.rows
            .read()
            .await
            .transactions
            .iter()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect()
    }

    /// Satoshis available to spend right now
    pub async fn balance(&self, account_id: AccountId) -> u64 {
        self.rows
            .read()
            .await
            .utxos
            .iter()
            .filter(|u| u.account_id == account_id && u.is_available())
            .map(|u| u.satoshis)
            .sum()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn select_spendable_utxos(
        &self,
        basket: Basket,
        account_id: AccountId,
    ) -> Result<Vec<Utxo>, LedgerError> {
        let rows = self.rows.read().await;
        Ok(rows
            .utxos
            .iter()
            .filter(|u| u.account_id == account_id && u.basket == basket && u.is_available())
            .cloned()
            .collect())
    }

    async fn pending_utxos(&self, account_id: AccountId) -> Result<Vec<Utxo>, LedgerError> {
        let rows = self.rows.read().await;
        Ok(rows
            .utxos
            .iter()
            .filter(|u| {
                u.account_id == account_id
                    && matches!(u.spending_status, SpendingStatus::Pending(_))
            })
            .cloned()
            .collect())
    }

    async fn active_locks(&self, account_id: AccountId) -> Result<Vec<LockedUtxo>, LedgerError> {
        let rows = self.rows.read().await;
        Ok(rows
            .locks
            .iter()
            .filter(|l| l.utxo.account_id == account_id && !l.unlocked)
            .map(|l| rows.lock_view(l))
            .collect())
    }

    async fn derived_addresses(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<DerivedAddress>, LedgerError> {
        let rows = self.rows.read().await;
        Ok(rows
            .derived_addresses
            .iter()
            .filter(|(account, _)| *account == account_id)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn insert_derived_address(
        &self,
        row: DerivedAddress,
        account_id: AccountId,
    ) -> Result<(), LedgerError> {
        let mut rows = self.rows.write().await;
        let exists = rows
            .derived_addresses
            .iter()
            .any(|(account, existing)| *account == account_id && existing.address == row.address);
        if !exists {
            rows.derived_addresses.push((account_id, row));
        }
        Ok(())
    }

    async fn transaction(
        &self,
        txid: &str,
        account_id: AccountId,
    ) -> Result<Option<TransactionRecord>, LedgerError> {
        let rows = self.rows.read().await;
        Ok(rows
            .transactions
            .iter()
            .find(|t| t.account_id == account_id && t.txid == txid)
            .cloned())
    }

    async fn mark_pending(
        &self,
        keys: &[OutPoint],
        txid: &str,
        account_id: AccountId,
    ) -> Result<(), LedgerError> {
        self.check_fault(FaultPoint::MarkPending)?;
        self.rows.write().await.mark_pending(keys, txid, account_id)
    }

    async fn confirm_spent(
        &self,
        keys: &[OutPoint],
        txid: &str,
        account_id: AccountId,
    ) -> Result<(), LedgerError> {
        self.check_fault(FaultPoint::ConfirmSpent)?;
        let mut rows = self.rows.write().await;
        let mut staged = rows.clone();
        staged.confirm_spent(keys, txid, account_id)?;
        *rows = staged;
        Ok(())
    }

    async fn rollback_pending(
        &self,
        keys: &[OutPoint],
        account_id: AccountId,
    ) -> Result<(), LedgerError> {
        self.check_fault(FaultPoint::RollbackPending)?;
        self.rows.write().await.rollback_pending(keys, account_id);
        Ok(())
    }

    async fn insert_utxo(&self, row: Utxo, account_id: AccountId) -> Result<OutPoint, LedgerError> {
        Ok(self.rows.write().await.insert_utxo(row, account_id))
    }

    async fn insert_lock(&self, row: LockedUtxo, account_id: AccountId) -> Result<(), LedgerError> {
        self.rows.write().await.insert_lock(row, account_id);
        Ok(())
    }

    async fn mark_lock_unlocked(
        &self,
        outpoint: &OutPoint,
        account_id: AccountId,
    ) -> Result<(), LedgerError> {
        self.rows
            .write()
            .await
            .mark_lock_unlocked(outpoint, account_id)
    }

    async fn record_transaction(
        &self,
        row: TransactionRecord,
        account_id: AccountId,
    ) -> Result<(), LedgerError> {
        self.rows.write().await.record_transaction(row, account_id);
        Ok(())
    }

    async fn run_atomic(
        &self,
        ops: Vec<LedgerOp>,
        account_id: AccountId,
    ) -> Result<(), LedgerError> {
        self.check_fault(FaultPoint::RunAtomic)?;
        let mut rows = self.rows.write().await;
        let mut staged = rows.clone();
        for op in ops {
            staged.apply(op, account_id)?;
        }
        *rows = staged;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn utxo(txid_byte: char, vout: u32, satoshis: u64) -> Utxo {
        Utxo {
            txid: txid_byte.to_string().repeat(64),
            vout,
            satoshis,
            locking_script_hex: String::new(),
            owning_address: "1owner".to_string(),
            basket: Basket::Default,
            spendable: true,
            spending_status: SpendingStatus::None,
            account_id: 0,
        }
    }

    async fn seeded() -> MemoryLedger {
        let ledger = MemoryLedger::new();
        for (c, sats) in [('a', 1_000), ('b', 2_000), ('c', 3_000)] {
            ledger.insert_utxo(utxo(c, 0, sats), 1).await.unwrap();
        }
        ledger
    }

    #[tokio::test]
    async fn test_select_in_insertion_order() {
        let ledger = seeded().await;
        let mut derived = utxo('d', 0, 500);
        derived.basket = Basket::Derived;
        ledger.insert_utxo(derived, 1).await.unwrap();

        let default = ledger.select_spendable_utxos(Basket::Default, 1).await.unwrap();
        let sats: Vec<u64> = default.iter().map(|u| u.satoshis).collect();
        assert_eq!(sats, vec![1_000, 2_000, 3_000]);

        let derived = ledger.select_spendable_utxos(Basket::Derived, 1).await.unwrap();
        assert_eq!(derived.len(), 1);
        assert!(ledger.select_spendable_utxos(Basket::Default, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let ledger = seeded().await;
        let outpoint = ledger.insert_utxo(utxo('a', 0, 99), 1).await.unwrap();
        assert_eq!(outpoint, OutPoint::new(&"a".repeat(64), 0));
        assert_eq!(ledger.utxos(1).await.len(), 3);
        assert_eq!(ledger.utxo(&outpoint, 1).await.unwrap().satoshis, 1_000);
    }

    #[tokio::test]
    async fn test_mark_pending_is_all_or_nothing() {
        let ledger = seeded().await;
        let a = OutPoint::new(&"a".repeat(64), 0);
        let b = OutPoint::new(&"b".repeat(64), 0);
        let missing = OutPoint::new(&"f".repeat(64), 0);

        ledger.mark_pending(&[a.clone()], "tx1", 1).await.unwrap();

        let err = ledger.mark_pending(&[b.clone(), a.clone()], "tx2", 1).await;
        assert!(matches!(err, Err(LedgerError::AlreadyClaimed { .. })));
        assert_eq!(
            ledger.utxo(&b, 1).await.unwrap().spending_status,
            SpendingStatus::None
        );

        let err = ledger.mark_pending(&[b.clone(), missing], "tx2", 1).await;
        assert!(matches!(err, Err(LedgerError::NotFound(_))));
        assert_eq!(ledger.balance(1).await, 5_000);
    }

    #[tokio::test]
    async fn test_confirm_and_rollback() {
        let ledger = seeded().await;
        let a = OutPoint::new(&"a".repeat(64), 0);
        let b = OutPoint::new(&"b".repeat(64), 0);

        ledger.mark_pending(&[a.clone(), b.clone()], "tx1", 1).await.unwrap();
        assert_eq!(ledger.pending_utxos(1).await.unwrap().len(), 2);

        ledger.confirm_spent(&[a.clone()], "tx1", 1).await.unwrap();
        ledger.rollback_pending(&[a.clone(), b.clone()], 1).await.unwrap();

        assert_eq!(
            ledger.utxo(&a, 1).await.unwrap().spending_status,
            SpendingStatus::Confirmed("tx1".to_string())
        );
        assert_eq!(
            ledger.utxo(&b, 1).await.unwrap().spending_status,
            SpendingStatus::None
        );
        assert!(ledger.pending_utxos(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_atomic_applies_all_or_nothing() {
        let ledger = seeded().await;
        let a = OutPoint::new(&"a".repeat(64), 0);
        ledger.mark_pending(&[a.clone()], "tx1", 1).await.unwrap();

        let failing = vec![
            LedgerOp::RecordTransaction(TransactionRecord::new("tx1", "00", "Sent", -500)),
            LedgerOp::ConfirmSpent {
                outpoints: vec![a.clone()],
                txid: "tx1".to_string(),
            },
            LedgerOp::MarkLockUnlocked(OutPoint::new("nope", 0)),
        ];
        assert!(matches!(
            ledger.run_atomic(failing, 1).await,
            Err(LedgerError::LockNotFound(_))
        ));
        assert!(ledger.transactions(1).await.is_empty());
        assert!(matches!(
            ledger.utxo(&a, 1).await.unwrap().spending_status,
            SpendingStatus::Pending(_)
        ));

        let ops = vec![
            LedgerOp::RecordTransaction(TransactionRecord::new("tx1", "00", "Sent", -500)),
            LedgerOp::ConfirmSpent {
                outpoints: vec![a.clone()],
                txid: "tx1".to_string(),
            },
            LedgerOp::InsertUtxo(utxo('e', 1, 480)),
        ];
        ledger.run_atomic(ops.clone(), 1).await.unwrap();
        // Replaying the same batch changes nothing
        ledger.run_atomic(ops, 1).await.unwrap();

        assert_eq!(ledger.transactions(1).await.len(), 1);
        assert_eq!(ledger.utxos(1).await.len(), 4);
        assert_eq!(ledger.balance(1).await, 2_000 + 3_000 + 480);
    }

    #[tokio::test]
    async fn test_locks() {
        let ledger = MemoryLedger::new();
        let mut backing = utxo('l', 0, 10_000);
        backing.basket = Basket::Locked;
        backing.spendable = false;
        let lock = LockedUtxo {
            utxo: backing,
            unlock_block: 900_000,
            lock_block: 899_000,
            public_key_hex: "02ab".to_string(),
            ordinal_origin: None,
            unlocked: false,
        };

        ledger.insert_lock(lock.clone(), 1).await.unwrap();
        ledger.insert_lock(lock.clone(), 1).await.unwrap();
        assert_eq!(ledger.active_locks(1).await.unwrap().len(), 1);
        assert_eq!(ledger.utxos(1).await.len(), 1);
        assert_eq!(ledger.balance(1).await, 0);

        ledger.mark_lock_unlocked(&lock.outpoint(), 1).await.unwrap();
        assert!(ledger.active_locks(1).await.unwrap().is_empty());
        assert_eq!(ledger.locks(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_locks_follow_backing_output() {
        let ledger = MemoryLedger::new();
        let mut backing = utxo('l', 0, 10_000);
        backing.basket = Basket::Locked;
        backing.spendable = false;
        let lock = LockedUtxo {
            utxo: backing,
            unlock_block: 900_000,
            lock_block: 899_000,
            public_key_hex: "02ab".to_string(),
            ordinal_origin: None,
            unlocked: false,
        };
        ledger.insert_lock(lock.clone(), 1).await.unwrap();

        let spender = "ee".repeat(32);
        ledger
            .mark_pending(&[lock.outpoint()], &spender, 1)
            .await
            .unwrap();
        let active = ledger.active_locks(1).await.unwrap();
        assert_eq!(
            active[0].utxo.spending_status,
            SpendingStatus::Pending(spender.clone())
        );

        ledger.rollback_pending(&[lock.outpoint()], 1).await.unwrap();
        let listed = ledger.locks(1).await;
        assert_eq!(listed[0].utxo.spending_status, SpendingStatus::None);
    }

    #[tokio::test]
    async fn test_transaction_upsert() {
        let ledger = MemoryLedger::new();
        ledger
            .record_transaction(TransactionRecord::new("tx", "00", "Sent", -100).with_label("send"), 1)
            .await
            .unwrap();
        ledger
            .record_transaction(TransactionRecord::new("tx", "", "", 0).with_label("p2p"), 1)
            .await
            .unwrap();

        let record = ledger.transaction("tx", 1).await.unwrap().unwrap();
        assert_eq!(record.amount, -100);
        assert_eq!(record.description, "Sent");
        assert_eq!(record.labels.len(), 2);
        assert!(ledger.transaction("tx", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fault_injection_is_one_shot() {
        let ledger = seeded().await;
        let a = OutPoint::new(&"a".repeat(64), 0);

        ledger.fail_next(FaultPoint::MarkPending);
        assert!(matches!(
            ledger.mark_pending(&[a.clone()], "tx", 1).await,
            Err(LedgerError::Storage(_))
        ));
        ledger.mark_pending(&[a], "tx", 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let ledger = seeded().await;
        ledger
            .insert_derived_address(
                DerivedAddress {
                    address: "1derived".to_string(),
                    sender_pubkey: "02cd".to_string(),
                    invoice_number: "7".to_string(),
                    legacy_private_key: None,
                },
                1,
            )
            .await
            .unwrap();
        ledger.save_to_file(&path).await.unwrap();

        let restored = MemoryLedger::load_from_file(&path).unwrap();
        assert_eq!(restored.snapshot().await, ledger.snapshot().await);
        assert_eq!(restored.derived_addresses(1).await.unwrap().len(), 1);
        assert_eq!(restored.balance(1).await, 6_000);
    }
}
