//! Wallet engine
//!
//! Public operations of the engine. Every operation that selects outputs
//! holds the spend guard from the ledger read until the saga finishes, and
//! every collaborator call is bounded by a timeout.

use crate::core::fee::{
    calculate_exact_fee, calculate_max_send, script_extra_bytes, ExactFee, FeeRate, MaxSend,
};
use crate::core::model::{
    AccountId, Basket, DerivedAddress, LockedUtxo, OutPoint, SpendingStatus, TransactionRecord,
    Utxo,
};
use crate::core::script::{locking_script_for_address, op_return_script, p2pkh_locking_script};
use crate::core::selection::{dedupe_utxos, select_coins};
use crate::core::timelock::{build_unlock_transaction, create_timelock_script};
use crate::core::transaction::{
    build_consolidation, SignedTransaction, SigningInput, TransactionBuilder, MAX_SATOSHIS,
};
use crate::crypto::{derive_child_address, public_key_from_hex, KeyPair, SigningStrategy};
use crate::engine::collaborators::{Broadcaster, ChainOracle, FeeOracle, KeyRole, KeyStore};
use crate::engine::config::EngineConfig;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::guard::SpendGuard;
use crate::engine::saga::{BroadcastSaga, SpendPlan};
use crate::engine::state::EngineState;
use crate::ledger::{LedgerOp, LedgerStore};
use log::{debug, info, warn};
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use zeroize::Zeroizing;

/// Label attached to the OP_RETURN output of a lock carrying a token origin
pub const LOCK_TAG: &[u8] = b"lock";

/// External services the engine works through
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn LedgerStore>,
    pub keys: Arc<dyn KeyStore>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub chain: Arc<dyn ChainOracle>,
    pub fees: Arc<dyn FeeOracle>,
}

/// Result of a broadcast operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendReceipt {
    pub txid: String,
    pub fee: u64,
    pub change: u64,
    /// False when the transaction is on the network but local rows lag behind
    pub ledger_synced: bool,
}

/// What a pending sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Spent by the transaction that claimed them
    pub confirmed: usize,
    /// Spent by some other transaction
    pub spent_elsewhere: usize,
    pub rolled_back: usize,
    /// Still pending, too young or unknown to the oracle
    pub waiting: usize,
}

/// Run a collaborator call under `limit`
pub(crate) async fn bounded<T, E, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> EngineResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<EngineError>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(EngineError::Timeout {
            operation,
            seconds: limit.as_secs(),
        }),
    }
}

/// Single-wallet transaction engine
pub struct WalletEngine {
    config: EngineConfig,
    ledger: Arc<dyn LedgerStore>,
    keys: Arc<dyn KeyStore>,
    broadcaster: Arc<dyn Broadcaster>,
    chain: Arc<dyn ChainOracle>,
    fees: Arc<dyn FeeOracle>,
    guard: SpendGuard,
    state: Mutex<Option<EngineState>>,
}

impl WalletEngine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ledger: collaborators.ledger,
            keys: collaborators.keys,
            broadcaster: collaborators.broadcaster,
            chain: collaborators.chain,
            fees: collaborators.fees,
            guard: SpendGuard::new(),
            state: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Open a session for the configured account
    pub async fn start_session(&self) {
        self.start_session_for(self.config.account_id).await;
    }

    pub async fn start_session_for(&self, account_id: AccountId) {
        let mut state = self.state.lock().await;
        *state = Some(EngineState::new(account_id, self.config.fee_quote_ttl()));
        info!("Wallet session opened for account {}", account_id);
    }

    /// Drop session state; operations fail with `WalletLocked` until reopened
    pub async fn end_session(&self) {
        if let Some(state) = self.state.lock().await.take() {
            info!(
                "Wallet session closed after {}s",
                state.session_age().as_secs()
            );
        }
    }

    pub async fn is_unlocked(&self) -> bool {
        self.state.lock().await.is_some()
    }

    async fn account(&self) -> EngineResult<AccountId> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|s| s.account_id)
            .ok_or(EngineError::WalletLocked)
    }

    // =========================================================================
    // Fee Rate
    // =========================================================================

    /// Pin the fee rate for this session, or clear the pin with `None`
    pub async fn set_fee_override(&self, rate: Option<FeeRate>) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let state = state.as_mut().ok_or(EngineError::WalletLocked)?;
        state.fee_override = rate.map(|r| self.config.clamp_fee_rate(r));
        Ok(())
    }

    /// Override, then a fresh network quote, then the configured default
    ///
    /// A failing fee oracle never fails the caller.
    pub async fn current_fee_rate(&self) -> EngineResult<FeeRate> {
        {
            let state = self.state.lock().await;
            let state = state.as_ref().ok_or(EngineError::WalletLocked)?;
            if let Some(rate) = state.fee_override {
                return Ok(rate);
            }
            if let Some(rate) = state.fee_cache.fresh() {
                return Ok(rate);
            }
        }

        match bounded(
            "fee quote",
            self.config.oracle_timeout(),
            self.fees.quote_fee_rate(),
        )
        .await
        {
            Ok(quote) => {
                let rate = self.config.clamp_fee_rate(quote);
                if let Some(state) = self.state.lock().await.as_mut() {
                    state.fee_cache.store(rate);
                }
                Ok(rate)
            }
            Err(e) => {
                warn!("Fee quote unavailable, using default: {}", e);
                Ok(self.config.default_fee_rate())
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Total of unclaimed outputs the engine can sign for
    pub async fn balance(&self) -> EngineResult<u64> {
        let account = self.account().await?;
        let (utxos, _) = self.funding_utxos(account).await?;
        Ok(utxos.iter().map(|u| u.satoshis).sum())
    }

    pub async fn max_sendable(&self) -> EngineResult<MaxSend> {
        let account = self.account().await?;
        let rate = self.current_fee_rate().await?;
        let (utxos, _) = self.funding_utxos(account).await?;
        Ok(calculate_max_send(&utxos, rate))
    }

    pub async fn exact_fee(&self, amount: u64) -> EngineResult<ExactFee> {
        let account = self.account().await?;
        let rate = self.current_fee_rate().await?;
        let (utxos, _) = self.funding_utxos(account).await?;
        Ok(calculate_exact_fee(amount, &utxos, rate))
    }

    /// Derive and store the receiving address for a counterparty invoice
    pub async fn register_derived_address(
        &self,
        sender_pubkey: &str,
        invoice_number: &str,
    ) -> EngineResult<String> {
        let account = self.account().await?;
        let counterparty = public_key_from_hex(sender_pubkey)?;
        let identity_wif = self.signing_key(KeyRole::Identity, "derive address").await?;
        let identity = KeyPair::from_wif(&identity_wif)?;
        let address =
            derive_child_address(&identity.secret_key, &counterparty, invoice_number)?;

        self.ledger
            .insert_derived_address(
                DerivedAddress {
                    address: address.clone(),
                    sender_pubkey: sender_pubkey.to_string(),
                    invoice_number: invoice_number.to_string(),
                    legacy_private_key: None,
                },
                account,
            )
            .await?;
        Ok(address)
    }

    // =========================================================================
    // Send
    // =========================================================================

    pub async fn send(&self, address: &str, satoshis: u64) -> EngineResult<SpendReceipt> {
        self.send_many(&[(address.to_string(), satoshis)], None)
            .await
    }

    /// Pay several recipients in one transaction
    ///
    /// Funds come from the wallet address and every registered derived
    /// address; each input is signed with its own key. Change goes to
    /// `change_address`, or to the wallet address.
    pub async fn send_many(
        &self,
        recipients: &[(String, u64)],
        change_address: Option<&str>,
    ) -> EngineResult<SpendReceipt> {
        if recipients.is_empty() {
            return Err(EngineError::InvalidParams("no recipients".to_string()));
        }
        if recipients.iter().any(|(_, sats)| *sats == 0) {
            return Err(EngineError::InvalidAmount);
        }
        let mut outputs = Vec::with_capacity(recipients.len());
        for (address, sats) in recipients {
            outputs.push((*sats, locking_script_for_address(address)?));
        }
        let change_script = change_address
            .map(locking_script_for_address)
            .transpose()?;
        let target = outputs
            .iter()
            .try_fold(0u64, |acc, (sats, _)| acc.checked_add(*sats))
            .filter(|total| *total <= MAX_SATOSHIS)
            .ok_or(EngineError::InvalidAmount)?;

        let account = self.account().await?;
        let rate = self.current_fee_rate().await?;
        let _permit = self.guard.acquire().await;

        let mut keys = KeyRing::new(self, "send");
        let wallet = keys.wallet().await?;
        let wallet_script = p2pkh_locking_script(&wallet.public_key_hash());
        let change_script = change_script.unwrap_or_else(|| wallet_script.clone());

        let (utxos, derived) = self.funding_utxos(account).await?;
        let extra: u64 = outputs
            .iter()
            .map(|(_, script)| script_extra_bytes(script.len()))
            .sum();
        let selection = select_coins(
            &utxos,
            target,
            outputs.len(),
            extra,
            rate,
            self.config.selection_buffer_sats,
        )?;
        let inputs = keys.signing_inputs(selection.selected, &derived).await?;

        let mut builder = TransactionBuilder::new(rate)
            .add_inputs(inputs)
            .change_to(change_script.clone());
        for (sats, script) in outputs {
            builder = builder.add_output(sats, script);
        }
        let signed = builder.build()?;

        let description = match recipients {
            [(address, sats)] => format!("Sent {} sats to {}", sats, address),
            _ => format!("Sent {} sats to {} recipients", target, recipients.len()),
        };
        let record = TransactionRecord::new(
            &signed.txid,
            &signed.raw_hex,
            &description,
            -((target + signed.fee) as i64),
        )
        .with_label("send");

        let mut plan = SpendPlan::new(&signed, record);
        if change_script == wallet_script {
            if let Some(change) = change_row(&signed, &wallet, account) {
                plan = plan.creating(LedgerOp::InsertUtxo(change));
            }
        }
        self.finish(plan, &signed, account).await
    }

    // =========================================================================
    // Consolidate
    // =========================================================================

    /// Merge wallet-address outputs into one
    pub async fn consolidate(&self, outpoints: &[OutPoint]) -> EngineResult<SpendReceipt> {
        let mut requested: Vec<OutPoint> = Vec::with_capacity(outpoints.len());
        for outpoint in outpoints {
            if !requested.contains(outpoint) {
                requested.push(outpoint.clone());
            }
        }
        if requested.len() < 2 {
            return Err(EngineError::InvalidParams(
                "consolidation needs at least two outputs".to_string(),
            ));
        }

        let account = self.account().await?;
        let rate = self.current_fee_rate().await?;
        let _permit = self.guard.acquire().await;

        let mut keys = KeyRing::new(self, "consolidate");
        let wallet = keys.wallet().await?;
        let available = self
            .ledger
            .select_spendable_utxos(Basket::Default, account)
            .await?;

        let mut inputs = Vec::with_capacity(requested.len());
        for outpoint in &requested {
            let utxo = available
                .iter()
                .find(|u| u.outpoint() == *outpoint && u.is_available())
                .ok_or_else(|| {
                    EngineError::InvalidParams(format!("{} is not spendable", outpoint))
                })?;
            inputs.push(SigningInput::new(utxo.clone(), wallet.secret_key));
        }

        let wallet_script = p2pkh_locking_script(&wallet.public_key_hash());
        let signed = build_consolidation(inputs, wallet_script.clone(), rate)?;

        let merged = Utxo {
            txid: signed.txid.clone(),
            vout: 0,
            satoshis: signed.total_input - signed.fee,
            locking_script_hex: hex::encode(&wallet_script),
            owning_address: wallet.address(),
            basket: Basket::Default,
            spendable: true,
            spending_status: SpendingStatus::None,
            account_id: account,
        };
        let record = TransactionRecord::new(
            &signed.txid,
            &signed.raw_hex,
            &format!("Consolidated {} outputs", signed.spent.len()),
            -(signed.fee as i64),
        )
        .with_label("consolidate");

        let plan = SpendPlan::new(&signed, record).creating(LedgerOp::InsertUtxo(merged));
        self.finish(plan, &signed, account).await
    }

    // =========================================================================
    // Lock / Unlock
    // =========================================================================

    /// Lock `satoshis` to the wallet key until `unlock_block`
    ///
    /// With `ordinal_origin`, an OP_RETURN output links the lock to that
    /// token.
    pub async fn lock(
        &self,
        satoshis: u64,
        unlock_block: u32,
        ordinal_origin: Option<&str>,
    ) -> EngineResult<SpendReceipt> {
        if satoshis == 0 || satoshis > MAX_SATOSHIS {
            return Err(EngineError::InvalidAmount);
        }

        let account = self.account().await?;
        let rate = self.current_fee_rate().await?;
        let _permit = self.guard.acquire().await;

        let height = self.block_height().await?;
        if unlock_block <= height {
            return Err(EngineError::InvalidParams(format!(
                "unlock block {} is not above current height {}",
                unlock_block, height
            )));
        }

        let mut keys = KeyRing::new(self, "lock");
        let wallet = keys.wallet().await?;
        let timelock_script = create_timelock_script(&wallet.public_key_hash(), unlock_block)?;
        let tag_script =
            ordinal_origin.map(|origin| op_return_script(&[LOCK_TAG, origin.as_bytes()]));

        let mut extra = script_extra_bytes(timelock_script.len());
        let mut num_outputs = 1;
        if let Some(tag) = &tag_script {
            extra += script_extra_bytes(tag.len());
            num_outputs += 1;
        }

        let (utxos, derived) = self.funding_utxos(account).await?;
        let selection = select_coins(
            &utxos,
            satoshis,
            num_outputs,
            extra,
            rate,
            self.config.selection_buffer_sats,
        )?;
        let inputs = keys.signing_inputs(selection.selected, &derived).await?;

        let wallet_script = p2pkh_locking_script(&wallet.public_key_hash());
        let mut builder = TransactionBuilder::new(rate)
            .add_inputs(inputs)
            .add_output(satoshis, timelock_script.clone())
            .change_to(wallet_script);
        if let Some(tag) = tag_script {
            builder = builder.add_output(0, tag);
        }
        let signed = builder.build()?;

        let lock_row = LockedUtxo {
            utxo: Utxo {
                txid: signed.txid.clone(),
                vout: 0,
                satoshis,
                locking_script_hex: hex::encode(&timelock_script),
                owning_address: wallet.address(),
                basket: Basket::Locked,
                spendable: false,
                spending_status: SpendingStatus::None,
                account_id: account,
            },
            unlock_block,
            lock_block: height,
            public_key_hex: wallet.public_key_hex(),
            ordinal_origin: ordinal_origin.map(str::to_string),
            unlocked: false,
        };
        let record = TransactionRecord::new(
            &signed.txid,
            &signed.raw_hex,
            &format!("Locked {} sats until block {}", satoshis, unlock_block),
            -((satoshis + signed.fee) as i64),
        )
        .with_label("lock");

        let mut plan = SpendPlan::new(&signed, record).creating(LedgerOp::InsertLock(lock_row));
        if let Some(change) = change_row(&signed, &wallet, account) {
            plan = plan.creating(LedgerOp::InsertUtxo(change));
        }
        self.finish(plan, &signed, account).await
    }

    /// Spend a matured lock back to the wallet address
    pub async fn unlock(&self, outpoint: &OutPoint) -> EngineResult<SpendReceipt> {
        let account = self.account().await?;
        let rate = self.current_fee_rate().await?;
        let _permit = self.guard.acquire().await;

        let locked = self
            .ledger
            .active_locks(account)
            .await?
            .into_iter()
            .find(|l| l.outpoint() == *outpoint)
            .ok_or_else(|| EngineError::InvalidParams(format!("no active lock at {}", outpoint)))?;

        if locked.utxo.spending_status != SpendingStatus::None {
            return Err(EngineError::InvalidParams(format!(
                "lock at {} is already being spent ({})",
                outpoint, locked.utxo.spending_status
            )));
        }

        let height = self.block_height().await?;
        if height < locked.unlock_block {
            return Err(EngineError::LockNotSpendable {
                blocks_remaining: locked.blocks_remaining(height),
            });
        }

        let mut keys = KeyRing::new(self, "unlock");
        let wallet = keys.wallet().await?;
        let wallet_script = p2pkh_locking_script(&wallet.public_key_hash());
        let signed = build_unlock_transaction(
            &locked,
            &wallet.secret_key,
            wallet_script.clone(),
            rate,
            height,
        )?;

        let released = signed.total_input - signed.fee;
        let unlocked = Utxo {
            txid: signed.txid.clone(),
            vout: 0,
            satoshis: released,
            locking_script_hex: hex::encode(&wallet_script),
            owning_address: wallet.address(),
            basket: Basket::Default,
            spendable: true,
            spending_status: SpendingStatus::None,
            account_id: account,
        };
        let record = TransactionRecord::new(
            &signed.txid,
            &signed.raw_hex,
            &format!("Unlocked {} sats", released),
            released as i64,
        )
        .with_label("unlock");

        let plan = SpendPlan::new(&signed, record)
            .creating(LedgerOp::MarkLockUnlocked(outpoint.clone()))
            .creating(LedgerOp::InsertUtxo(unlocked));
        self.finish(plan, &signed, account).await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Resolve outputs stuck in `pending` through the chain oracle
    ///
    /// Spent outputs are confirmed against whoever spent them. Unspent ones
    /// roll back once they have been seen pending for longer than
    /// `pending_sweep_after_secs`.
    pub async fn sweep_stale_pending(&self) -> EngineResult<SweepReport> {
        let account = self.account().await?;
        let _permit = self.guard.acquire().await;

        let pending = self.ledger.pending_utxos(account).await?;
        let mut report = SweepReport::default();
        let mut still_pending = Vec::new();

        for utxo in pending {
            let outpoint = utxo.outpoint();
            let claimed_by = match &utxo.spending_status {
                SpendingStatus::Pending(txid) => txid.clone(),
                _ => continue,
            };

            let spent_by = match bounded(
                "spent-output query",
                self.config.oracle_timeout(),
                self.chain.output_spent_by(&utxo.txid, utxo.vout),
            )
            .await
            {
                Ok(spent_by) => spent_by,
                Err(e) => {
                    warn!("Could not check {}: {}", outpoint, e);
                    report.waiting += 1;
                    still_pending.push(outpoint);
                    continue;
                }
            };

            match spent_by {
                Some(spender) => {
                    if spender == claimed_by {
                        report.confirmed += 1;
                    } else {
                        warn!(
                            "{} claimed by {} was spent by {}",
                            outpoint, claimed_by, spender
                        );
                        report.spent_elsewhere += 1;
                    }
                    self.ledger
                        .confirm_spent(std::slice::from_ref(&outpoint), &spender, account)
                        .await?;
                }
                None => {
                    let age = self.pending_age(&outpoint).await;
                    if age >= self.config.pending_sweep_after() {
                        info!("Rolling back {} left pending by {}", outpoint, claimed_by);
                        self.ledger
                            .rollback_pending(std::slice::from_ref(&outpoint), account)
                            .await?;
                        report.rolled_back += 1;
                    } else {
                        report.waiting += 1;
                        still_pending.push(outpoint);
                    }
                }
            }
        }

        if let Some(state) = self.state.lock().await.as_mut() {
            state.retain_pending(&still_pending);
        }
        Ok(report)
    }

    /// Mark locks whose output the chain reports spent as unlocked
    pub async fn reconcile_locks(&self) -> EngineResult<usize> {
        let account = self.account().await?;
        let _permit = self.guard.acquire().await;

        let mut reconciled = 0;
        for lock in self.ledger.active_locks(account).await? {
            let outpoint = lock.outpoint();
            let spender = match bounded(
                "spent-output query",
                self.config.oracle_timeout(),
                self.chain.output_spent_by(&outpoint.txid, outpoint.vout),
            )
            .await
            {
                Ok(Some(spender)) => spender,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Could not check lock {}: {}", outpoint, e);
                    continue;
                }
            };

            info!("Lock {} was spent by {}", outpoint, spender);
            self.ledger
                .run_atomic(
                    vec![
                        LedgerOp::MarkLockUnlocked(outpoint.clone()),
                        LedgerOp::ConfirmSpent {
                            outpoints: vec![outpoint],
                            txid: spender,
                        },
                    ],
                    account,
                )
                .await?;
            reconciled += 1;
        }
        Ok(reconciled)
    }

    /// Run the pending sweep every `every` until the handle is aborted
    ///
    /// Ticks while the wallet is locked are skipped.
    pub fn spawn_pending_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        let every = every.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.sweep_stale_pending().await {
                    Ok(report) if report != SweepReport::default() => {
                        info!("Pending sweep: {:?}", report)
                    }
                    Ok(_) => {}
                    Err(EngineError::WalletLocked) => {
                        debug!("Pending sweep skipped: wallet locked")
                    }
                    Err(e) => warn!("Pending sweep failed: {}", e),
                }
            }
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn signing_key(
        &self,
        role: KeyRole,
        operation: &str,
    ) -> EngineResult<Zeroizing<String>> {
        bounded(
            "key store",
            self.config.key_store_timeout(),
            self.keys.signing_key(role, operation),
        )
        .await
    }

    async fn block_height(&self) -> EngineResult<u32> {
        bounded(
            "block height",
            self.config.oracle_timeout(),
            self.chain.block_height(),
        )
        .await
    }

    /// Start the sweep clock for inputs a failed broadcast left claimed
    async fn note_left_pending(&self, plan: &SpendPlan, account: AccountId) {
        let claimed = SpendingStatus::Pending(plan.txid.clone());
        let rows = match self.ledger.pending_utxos(account).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Could not list pending outputs of {}: {}", plan.txid, e);
                return;
            }
        };
        if let Some(state) = self.state.lock().await.as_mut() {
            for utxo in rows.iter().filter(|u| u.spending_status == claimed) {
                state.note_pending(&utxo.outpoint());
            }
        }
    }

    async fn pending_age(&self, outpoint: &OutPoint) -> Duration {
        match self.state.lock().await.as_mut() {
            Some(state) => state.note_pending(outpoint).elapsed(),
            None => Duration::ZERO,
        }
    }

    /// Unclaimed outputs the engine can sign for, with the derived address rows
    ///
    /// Derived-basket outputs without a matching address row are left out.
    async fn funding_utxos(
        &self,
        account: AccountId,
    ) -> EngineResult<(Vec<Utxo>, HashMap<String, DerivedAddress>)> {
        let derived: HashMap<String, DerivedAddress> = self
            .ledger
            .derived_addresses(account)
            .await?
            .into_iter()
            .map(|d| (d.address.clone(), d))
            .collect();

        let mut utxos = self
            .ledger
            .select_spendable_utxos(Basket::Default, account)
            .await?;
        for utxo in self
            .ledger
            .select_spendable_utxos(Basket::Derived, account)
            .await?
        {
            if derived.contains_key(&utxo.owning_address) {
                utxos.push(utxo);
            } else {
                warn!(
                    "Skipping {}: no derivation data for {}",
                    utxo.outpoint(),
                    utxo.owning_address
                );
            }
        }
        Ok((dedupe_utxos(utxos), derived))
    }

    async fn finish(
        &self,
        plan: SpendPlan,
        signed: &SignedTransaction,
        account: AccountId,
    ) -> EngineResult<SpendReceipt> {
        let saga = BroadcastSaga {
            ledger: self.ledger.as_ref(),
            broadcaster: self.broadcaster.as_ref(),
            chain: self.chain.as_ref(),
            account_id: account,
            network_timeout: self.config.network_timeout(),
            oracle_timeout: self.config.oracle_timeout(),
        };
        let outcome = match saga.run(&plan).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(e, EngineError::BroadcastFailed { .. }) {
                    self.note_left_pending(&plan, account).await;
                }
                return Err(e);
            }
        };
        Ok(SpendReceipt {
            txid: outcome.txid,
            fee: signed.fee,
            change: signed.change,
            ledger_synced: outcome.ledger_synced,
        })
    }
}

/// Keys fetched once per operation and dropped with it
struct KeyRing<'a> {
    engine: &'a WalletEngine,
    operation: &'static str,
    wifs: HashMap<KeyRole, Zeroizing<String>>,
}

impl<'a> KeyRing<'a> {
    fn new(engine: &'a WalletEngine, operation: &'static str) -> Self {
        Self {
            engine,
            operation,
            wifs: HashMap::new(),
        }
    }

    async fn wif(&mut self, role: KeyRole) -> EngineResult<Zeroizing<String>> {
        if let Some(wif) = self.wifs.get(&role) {
            return Ok(wif.clone());
        }
        let wif = self.engine.signing_key(role, self.operation).await?;
        self.wifs.insert(role, wif.clone());
        Ok(wif)
    }

    async fn wallet(&mut self) -> EngineResult<KeyPair> {
        let wif = self.wif(KeyRole::Wallet).await?;
        Ok(KeyPair::from_wif(&wif)?)
    }

    /// Pair every selected output with its key, resolving each address once
    async fn signing_inputs(
        &mut self,
        selected: Vec<Utxo>,
        derived: &HashMap<String, DerivedAddress>,
    ) -> EngineResult<Vec<SigningInput>> {
        let mut resolved: HashMap<String, SecretKey> = HashMap::new();
        let mut inputs = Vec::with_capacity(selected.len());

        for utxo in selected {
            let key = match resolved.get(&utxo.owning_address) {
                Some(key) => *key,
                None => {
                    let strategy = self.strategy_for(&utxo, derived).await?;
                    let key = strategy.resolve()?;
                    resolved.insert(utxo.owning_address.clone(), key);
                    key
                }
            };
            inputs.push(SigningInput::new(utxo, key));
        }
        Ok(inputs)
    }

    async fn strategy_for(
        &mut self,
        utxo: &Utxo,
        derived: &HashMap<String, DerivedAddress>,
    ) -> EngineResult<SigningStrategy> {
        if utxo.basket != Basket::Derived {
            return Ok(SigningStrategy::OwnerKey(self.wif(KeyRole::Wallet).await?));
        }

        let row = derived.get(&utxo.owning_address).ok_or_else(|| {
            EngineError::InvalidParams(format!(
                "no derivation data for {}",
                utxo.owning_address
            ))
        })?;
        if let Some(wif) = &row.legacy_private_key {
            return Ok(SigningStrategy::OwnerKey(Zeroizing::new(wif.clone())));
        }
        Ok(SigningStrategy::DerivedKey {
            identity_wif: self.wif(KeyRole::Identity).await?,
            counterparty_pubkey: row.sender_pubkey.clone(),
            invoice_number: row.invoice_number.clone(),
        })
    }
}

/// Change output of `signed` as a wallet row
fn change_row(signed: &SignedTransaction, wallet: &KeyPair, account: AccountId) -> Option<Utxo> {
    let vout = signed.change_vout?;
    let output = signed.outputs().get(vout as usize)?;
    Some(Utxo {
        txid: signed.txid.clone(),
        vout,
        satoshis: output.satoshis,
        locking_script_hex: hex::encode(&output.locking_script),
        owning_address: wallet.address(),
        basket: Basket::Default,
        spendable: true,
        spending_status: SpendingStatus::None,
        account_id: account,
    })
}
