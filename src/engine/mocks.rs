//! In-crate collaborators for engine tests

use crate::core::fee::FeeRate;
use crate::core::model::{AccountId, Basket, OutPoint, SpendingStatus, Utxo};
use crate::core::script::p2pkh_locking_script;
use crate::crypto::KeyPair;
use crate::engine::collaborators::{
    BroadcastError, Broadcaster, ChainOracle, FeeOracle, KeyRole, KeyStore, KeyStoreError,
    OracleError,
};
use crate::engine::config::EngineConfig;
use crate::engine::wallet::{Collaborators, WalletEngine};
use crate::ledger::{LedgerStore, MemoryLedger};
use async_trait::async_trait;
use secp256k1::SecretKey;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use zeroize::Zeroizing;

pub const ACCOUNT: AccountId = 1;
pub const START_HEIGHT: u32 = 899_000;

pub fn wallet_key() -> KeyPair {
    KeyPair::from_secret_key(SecretKey::from_slice(&[0x11; 32]).unwrap())
}

pub fn identity_key() -> KeyPair {
    KeyPair::from_secret_key(SecretKey::from_slice(&[0x22; 32]).unwrap())
}

pub fn ordinals_key() -> KeyPair {
    KeyPair::from_secret_key(SecretKey::from_slice(&[0x33; 32]).unwrap())
}

pub fn counterparty_key() -> KeyPair {
    KeyPair::from_secret_key(SecretKey::from_slice(&[0x44; 32]).unwrap())
}

/// A spendable output paying `owner`
pub fn utxo_for(owner: &KeyPair, txid_byte: u8, vout: u32, satoshis: u64, basket: Basket) -> Utxo {
    Utxo {
        txid: hex::encode([txid_byte; 32]),
        vout,
        satoshis,
        locking_script_hex: hex::encode(p2pkh_locking_script(&owner.public_key_hash())),
        owning_address: owner.address(),
        basket,
        spendable: true,
        spending_status: SpendingStatus::None,
        account_id: ACCOUNT,
    }
}

// =============================================================================
// Key Store
// =============================================================================

pub struct MockKeyStore {
    keys: HashMap<KeyRole, String>,
    locked: AtomicBool,
    requests: Mutex<Vec<(KeyRole, String)>>,
}

impl MockKeyStore {
    pub fn new() -> Self {
        let mut keys = HashMap::new();
        keys.insert(KeyRole::Wallet, wallet_key().to_wif());
        keys.insert(KeyRole::Identity, identity_key().to_wif());
        keys.insert(KeyRole::Ordinals, ordinals_key().to_wif());
        Self {
            keys,
            locked: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<(KeyRole, String)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyStore for MockKeyStore {
    async fn signing_key(
        &self,
        role: KeyRole,
        operation: &str,
    ) -> Result<Zeroizing<String>, KeyStoreError> {
        self.requests
            .lock()
            .unwrap()
            .push((role, operation.to_string()));
        if self.locked.load(Ordering::SeqCst) {
            return Err(KeyStoreError::Locked);
        }
        self.keys
            .get(&role)
            .map(|wif| Zeroizing::new(wif.clone()))
            .ok_or_else(|| KeyStoreError::Missing(role.to_string()))
    }
}

// =============================================================================
// Network (broadcaster + chain oracle)
// =============================================================================

/// Broadcaster and chain oracle sharing one view of the chain
///
/// Broadcasts are accepted unless a response was queued. Spent-output
/// queries answer from explicit spends first, then a foreign spender, then
/// the last broadcast txid when ambiguous broadcasts are set to land.
pub struct MockNetwork {
    height: AtomicU32,
    responses: Mutex<VecDeque<BroadcastError>>,
    broadcasts: Mutex<Vec<String>>,
    spends: Mutex<HashMap<OutPoint, String>>,
    foreign_spender: Mutex<Option<String>>,
    landed: AtomicBool,
    chain_down: AtomicBool,
    latency: Duration,
}

impl MockNetwork {
    pub fn new(height: u32) -> Self {
        Self::with_latency(height, Duration::ZERO)
    }

    pub fn with_latency(height: u32, latency: Duration) -> Self {
        Self {
            height: AtomicU32::new(height),
            responses: Mutex::new(VecDeque::new()),
            broadcasts: Mutex::new(Vec::new()),
            spends: Mutex::new(HashMap::new()),
            foreign_spender: Mutex::new(None),
            landed: AtomicBool::new(false),
            chain_down: AtomicBool::new(false),
            latency,
        }
    }

    pub fn set_height(&self, height: u32) {
        self.height.store(height, Ordering::SeqCst);
    }

    /// Fail the next broadcast with `error`
    pub fn fail_next(&self, error: BroadcastError) {
        self.responses.lock().unwrap().push_back(error);
    }

    /// Ambiguous failures still reach the chain
    pub fn set_landed(&self, landed: bool) {
        self.landed.store(landed, Ordering::SeqCst);
    }

    pub fn set_chain_down(&self, down: bool) {
        self.chain_down.store(down, Ordering::SeqCst);
    }

    pub fn set_foreign_spender(&self, txid: &str) {
        *self.foreign_spender.lock().unwrap() = Some(txid.to_string());
    }

    pub fn mark_spent(&self, outpoint: OutPoint, txid: &str) {
        self.spends.lock().unwrap().insert(outpoint, txid.to_string());
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.broadcasts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Broadcaster for MockNetwork {
    async fn broadcast(&self, _raw_hex: &str, txid: &str) -> Result<String, BroadcastError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.broadcasts.lock().unwrap().push(txid.to_string());
        match self.responses.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(txid.to_string()),
        }
    }
}

#[async_trait]
impl ChainOracle for MockNetwork {
    async fn block_height(&self) -> Result<u32, OracleError> {
        if self.chain_down.load(Ordering::SeqCst) {
            return Err(OracleError("chain oracle offline".to_string()));
        }
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn output_spent_by(&self, txid: &str, vout: u32) -> Result<Option<String>, OracleError> {
        if self.chain_down.load(Ordering::SeqCst) {
            return Err(OracleError("chain oracle offline".to_string()));
        }
        if let Some(spender) = self.spends.lock().unwrap().get(&OutPoint::new(txid, vout)) {
            return Ok(Some(spender.clone()));
        }
        if let Some(foreign) = self.foreign_spender.lock().unwrap().clone() {
            return Ok(Some(foreign));
        }
        if self.landed.load(Ordering::SeqCst) {
            return Ok(self.broadcasts.lock().unwrap().last().cloned());
        }
        Ok(None)
    }
}

// =============================================================================
// Fee Oracle
// =============================================================================

pub struct MockFeeOracle {
    quote: Mutex<Result<FeeRate, OracleError>>,
    calls: AtomicUsize,
}

impl MockFeeOracle {
    pub fn new(rate: FeeRate) -> Self {
        Self {
            quote: Mutex::new(Ok(rate)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_quote(&self, quote: Result<FeeRate, OracleError>) {
        *self.quote.lock().unwrap() = quote;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeeOracle for MockFeeOracle {
    async fn quote_fee_rate(&self) -> Result<FeeRate, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.quote.lock().unwrap().clone()
    }
}

// =============================================================================
// Harness
// =============================================================================

/// An unlocked engine wired to mock collaborators and a memory ledger
pub struct Harness {
    pub engine: Arc<WalletEngine>,
    pub ledger: Arc<MemoryLedger>,
    pub network: Arc<MockNetwork>,
    pub keys: Arc<MockKeyStore>,
    pub fees: Arc<MockFeeOracle>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(EngineConfig::default(), MockNetwork::new(START_HEIGHT)).await
    }

    pub async fn build(config: EngineConfig, network: MockNetwork) -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let network = Arc::new(network);
        let keys = Arc::new(MockKeyStore::new());
        let fees = Arc::new(MockFeeOracle::new(FeeRate(100)));

        let engine = WalletEngine::new(
            config,
            Collaborators {
                ledger: ledger.clone(),
                keys: keys.clone(),
                broadcaster: network.clone(),
                chain: network.clone(),
                fees: fees.clone(),
            },
        )
        .unwrap();
        engine.start_session().await;
        let engine = Arc::new(engine);

        Self {
            engine,
            ledger,
            network,
            keys,
            fees,
        }
    }

    /// Deposit `satoshis` to the wallet address
    pub async fn fund(&self, txid_byte: u8, satoshis: u64) -> OutPoint {
        self.ledger
            .insert_utxo(
                utxo_for(&wallet_key(), txid_byte, 0, satoshis, Basket::Default),
                ACCOUNT,
            )
            .await
            .unwrap()
    }

    pub async fn status(&self, outpoint: &OutPoint) -> SpendingStatus {
        self.ledger
            .utxo(outpoint, ACCOUNT)
            .await
            .map(|u| u.spending_status)
            .unwrap_or_default()
    }
}
