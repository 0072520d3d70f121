//! Transaction model, signing and building
//!
//! Implements the BSV wire format:
//! - Version 1 transactions with varint-prefixed inputs and outputs
//! - Txid = reversed double SHA-256 of the serialization
//! - BIP-143 style preimages signed with SIGHASH_ALL | FORKID
//! - Multi-key building, where every input carries its own resolved key

use crate::core::fee::{calculate_tx_fee, plan_change, script_extra_bytes, FeeRate};
use crate::core::model::{OutPoint, Utxo};
use crate::core::script::{
    p2pkh_locking_script, p2pkh_pubkey_hash, p2pkh_unlocking_script, script_from_hex,
    ScriptError, SIGHASH_ALL_FORKID,
};
use crate::crypto::{double_sha256, hash160, sign_digest, KeyError};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Transaction version
pub const TX_VERSION: u32 = 1;

/// Sequence number that disables lock time for an input
pub const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;

/// Lock time values below this are block heights, above are timestamps
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Total supply in satoshis; no output or payment can exceed it
pub const MAX_SATOSHIS: u64 = 21_000_000 * 100_000_000;

// =============================================================================
// Error Types
// =============================================================================

/// Transaction-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Insufficient funds: need {required} sats, have {available}")]
    InsufficientFunds { required: u64, available: u64 },
    #[error("Invalid amount")]
    InvalidAmount,
    #[error("Transaction has no inputs")]
    NoInputs,
    #[error("Transaction has no outputs")]
    NoOutputs,
    #[error("Consolidation needs at least 2 inputs, got {0}")]
    TooFewInputs(usize),
    #[error("Invalid txid: {0}")]
    InvalidTxid(String),
    #[error("Input index {0} out of range")]
    InputIndexOutOfRange(usize),
    #[error("Signing key does not match the locking script of {0}")]
    KeyMismatch(OutPoint),
    #[error("Lock is not spendable for another {blocks_remaining} blocks")]
    LockNotSpendable { blocks_remaining: u32 },
    #[error("No sequence number yields a valid preimage signature")]
    NoValidSequence,
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),
}

// =============================================================================
// Varints
// =============================================================================

/// Serialized length of a varint
pub fn varint_len(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

pub fn write_varint(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

// =============================================================================
// Transaction Input / Output
// =============================================================================

/// Transaction input spending a previous output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    /// Previous txid in internal (little-endian) byte order
    pub prev_hash: [u8; 32],
    pub vout: u32,
    /// Value of the spent output, committed to by the signature
    pub satoshis: u64,
    /// Locking script of the spent output
    pub locking_script: Vec<u8>,
    pub unlocking_script: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    pub fn new(
        txid: &str,
        vout: u32,
        satoshis: u64,
        locking_script: Vec<u8>,
    ) -> Result<Self, TransactionError> {
        let mut prev_hash: [u8; 32] = hex::decode(txid)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| TransactionError::InvalidTxid(txid.to_string()))?;
        prev_hash.reverse();

        Ok(Self {
            prev_hash,
            vout,
            satoshis,
            locking_script,
            unlocking_script: Vec::new(),
            sequence: SEQUENCE_FINAL,
        })
    }

    /// Txid of the spent output in display order
    pub fn prev_txid(&self) -> String {
        let mut hash = self.prev_hash;
        hash.reverse();
        hex::encode(hash)
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(&self.prev_txid(), self.vout)
    }

    fn write_outpoint(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.prev_hash);
        out.extend_from_slice(&self.vout.to_le_bytes());
    }
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub satoshis: u64,
    pub locking_script: Vec<u8>,
}

impl TxOutput {
    pub fn new(satoshis: u64, locking_script: Vec<u8>) -> Self {
        Self {
            satoshis,
            locking_script,
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.satoshis.to_le_bytes());
        write_var_bytes(out, &self.locking_script);
    }
}

// =============================================================================
// Transaction
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Block height (or timestamp) before which the transaction is invalid
    pub locktime: u32,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: TX_VERSION,
            inputs,
            outputs,
            locktime: 0,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10 + self.inputs.len() * 148 + self.outputs.len() * 34);
        out.extend_from_slice(&self.version.to_le_bytes());

        write_varint(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            input.write_outpoint(&mut out);
            write_var_bytes(&mut out, &input.unlocking_script);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }

        write_varint(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            output.write(&mut out);
        }

        out.extend_from_slice(&self.locktime.to_le_bytes());
        out
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.serialize())
    }

    pub fn size(&self) -> usize {
        self.serialize().len()
    }

    /// Reversed double SHA-256 of the serialization
    pub fn txid(&self) -> String {
        let mut hash = double_sha256(&self.serialize());
        hash.reverse();
        hex::encode(hash)
    }

    pub fn total_input(&self) -> u64 {
        self.inputs.iter().map(|i| i.satoshis).sum()
    }

    pub fn total_output(&self) -> u64 {
        self.outputs.iter().map(|o| o.satoshis).sum()
    }

    /// Signature preimage for `input_index` under SIGHASH_ALL | FORKID
    ///
    /// ```text
    /// version | hashPrevouts | hashSequence | outpoint | scriptCode
    ///   | value | nSequence | hashOutputs | nLockTime | sighash type
    /// ```
    pub fn sighash_preimage(&self, input_index: usize) -> Result<Vec<u8>, TransactionError> {
        let input = self
            .inputs
            .get(input_index)
            .ok_or(TransactionError::InputIndexOutOfRange(input_index))?;

        let mut prevouts = Vec::with_capacity(self.inputs.len() * 36);
        let mut sequences = Vec::with_capacity(self.inputs.len() * 4);
        for i in &self.inputs {
            i.write_outpoint(&mut prevouts);
            sequences.extend_from_slice(&i.sequence.to_le_bytes());
        }
        let mut outputs = Vec::with_capacity(self.outputs.len() * 34);
        for o in &self.outputs {
            o.write(&mut outputs);
        }

        let mut preimage = Vec::with_capacity(156 + 9 + input.locking_script.len());
        preimage.extend_from_slice(&self.version.to_le_bytes());
        preimage.extend_from_slice(&double_sha256(&prevouts));
        preimage.extend_from_slice(&double_sha256(&sequences));
        input.write_outpoint(&mut preimage);
        write_var_bytes(&mut preimage, &input.locking_script);
        preimage.extend_from_slice(&input.satoshis.to_le_bytes());
        preimage.extend_from_slice(&input.sequence.to_le_bytes());
        preimage.extend_from_slice(&double_sha256(&outputs));
        preimage.extend_from_slice(&self.locktime.to_le_bytes());
        preimage.extend_from_slice(&(SIGHASH_ALL_FORKID as u32).to_le_bytes());
        Ok(preimage)
    }

    /// Digest signed for `input_index`
    pub fn sighash(&self, input_index: usize) -> Result<[u8; 32], TransactionError> {
        Ok(double_sha256(&self.sighash_preimage(input_index)?))
    }

    /// DER signature with the sighash byte appended
    pub fn signature_for(
        &self,
        input_index: usize,
        key: &SecretKey,
    ) -> Result<Vec<u8>, TransactionError> {
        let mut signature = sign_digest(key, self.sighash(input_index)?);
        signature.push(SIGHASH_ALL_FORKID);
        Ok(signature)
    }

    /// Sign a P2PKH input, installing `<sig> <pubkey>` as its unlocking script
    pub fn sign_p2pkh_input(
        &mut self,
        input_index: usize,
        key: &SecretKey,
    ) -> Result<(), TransactionError> {
        let secp = Secp256k1::signing_only();
        let public_key = PublicKey::from_secret_key(&secp, key).serialize();
        let signature = self.signature_for(input_index, key)?;
        self.inputs[input_index].unlocking_script = p2pkh_unlocking_script(&signature, &public_key);
        Ok(())
    }
}

// =============================================================================
// Signed Transaction
// =============================================================================

/// A fully signed transaction ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub transaction: Transaction,
    pub raw_hex: String,
    pub txid: String,
    pub fee: u64,
    /// Zero when no change output was added
    pub change: u64,
    pub change_vout: Option<u32>,
    pub total_input: u64,
    /// Outpoints consumed by this transaction
    pub spent: Vec<OutPoint>,
}

impl SignedTransaction {
    pub(crate) fn finish(transaction: Transaction, fee: u64, change: u64, change_vout: Option<u32>) -> Self {
        Self {
            raw_hex: transaction.to_hex(),
            txid: transaction.txid(),
            total_input: transaction.total_input(),
            spent: transaction.inputs.iter().map(TxInput::outpoint).collect(),
            transaction,
            fee,
            change,
            change_vout,
        }
    }

    pub fn outputs(&self) -> &[TxOutput] {
        &self.transaction.outputs
    }
}

// =============================================================================
// Transaction Builder
// =============================================================================

/// A UTXO paired with the key that unlocks it
#[derive(Clone)]
pub struct SigningInput {
    pub utxo: Utxo,
    pub key: SecretKey,
}

impl SigningInput {
    pub fn new(utxo: Utxo, key: SecretKey) -> Self {
        Self { utxo, key }
    }

    /// The UTXO's P2PKH script, checked against this input's key
    ///
    /// UTXOs stored without a script are assumed to pay the key directly.
    fn locking_script(&self) -> Result<Vec<u8>, TransactionError> {
        let secp = Secp256k1::signing_only();
        let key_hash = hash160(&PublicKey::from_secret_key(&secp, &self.key).serialize());

        if self.utxo.locking_script_hex.is_empty() {
            return Ok(p2pkh_locking_script(&key_hash));
        }
        let script = script_from_hex(&self.utxo.locking_script_hex)?;
        match p2pkh_pubkey_hash(&script) {
            Some(hash) if hash == key_hash => Ok(script),
            _ => Err(TransactionError::KeyMismatch(self.utxo.outpoint())),
        }
    }
}

impl std::fmt::Debug for SigningInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningInput")
            .field("utxo", &self.utxo.outpoint())
            .finish_non_exhaustive()
    }
}

/// Builder for signed P2PKH-funded transactions
///
/// Outputs are added with their final locking scripts; the fee estimate
/// accounts for any output larger than a standard P2PKH output. Change goes
/// to the explicit change script, or back to the first input's key.
pub struct TransactionBuilder {
    inputs: Vec<SigningInput>,
    outputs: Vec<TxOutput>,
    change_script: Option<Vec<u8>>,
    fee_rate: FeeRate,
}

impl TransactionBuilder {
    pub fn new(fee_rate: FeeRate) -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            change_script: None,
            fee_rate,
        }
    }

    pub fn add_input(mut self, input: SigningInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn add_inputs(mut self, inputs: impl IntoIterator<Item = SigningInput>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn add_output(mut self, satoshis: u64, locking_script: Vec<u8>) -> Self {
        self.outputs.push(TxOutput::new(satoshis, locking_script));
        self
    }

    pub fn change_to(mut self, locking_script: Vec<u8>) -> Self {
        self.change_script = Some(locking_script);
        self
    }

    /// Bytes the outputs add beyond their P2PKH-sized estimate
    fn extra_output_bytes(&self) -> u64 {
        self.outputs
            .iter()
            .map(|o| script_extra_bytes(o.locking_script.len()))
            .sum()
    }

    /// Plan fee and change, then sign every input with its own key
    pub fn build(self) -> Result<SignedTransaction, TransactionError> {
        let first = self.inputs.first().ok_or(TransactionError::NoInputs)?;
        if self.outputs.is_empty() {
            return Err(TransactionError::NoOutputs);
        }

        let total_input: u64 = self.inputs.iter().map(|i| i.utxo.satoshis).sum();
        let total_output: u64 = self.outputs.iter().map(|o| o.satoshis).sum();
        let plan = plan_change(
            total_input,
            total_output,
            self.inputs.len(),
            self.outputs.len(),
            self.extra_output_bytes(),
            self.fee_rate,
        )
        .map_err(|s| TransactionError::InsufficientFunds {
            required: s.required,
            available: s.available,
        })?;

        let change_script = match self.change_script {
            Some(script) => script,
            None => first.locking_script()?,
        };

        let mut tx_inputs = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            tx_inputs.push(TxInput::new(
                &input.utxo.txid,
                input.utxo.vout,
                input.utxo.satoshis,
                input.locking_script()?,
            )?);
        }

        let mut outputs = self.outputs;
        let change_vout = if plan.has_change() {
            outputs.push(TxOutput::new(plan.change, change_script));
            Some((outputs.len() - 1) as u32)
        } else {
            None
        };

        let mut tx = Transaction::new(tx_inputs, outputs);
        for (index, input) in self.inputs.iter().enumerate() {
            tx.sign_p2pkh_input(index, &input.key)?;
        }

        Ok(SignedTransaction::finish(tx, plan.fee, plan.change, change_vout))
    }
}

/// Sweep every input into one output, paying the fee from the total
pub fn build_consolidation(
    inputs: Vec<SigningInput>,
    destination_script: Vec<u8>,
    fee_rate: FeeRate,
) -> Result<SignedTransaction, TransactionError> {
    if inputs.len() < 2 {
        return Err(TransactionError::TooFewInputs(inputs.len()));
    }

    let total_input: u64 = inputs.iter().map(|i| i.utxo.satoshis).sum();
    let fee = calculate_tx_fee(inputs.len(), 1, 0, fee_rate);
    if total_input <= fee {
        return Err(TransactionError::InsufficientFunds {
            required: fee + 1,
            available: total_input,
        });
    }

    let mut tx_inputs = Vec::with_capacity(inputs.len());
    for input in &inputs {
        tx_inputs.push(TxInput::new(
            &input.utxo.txid,
            input.utxo.vout,
            input.utxo.satoshis,
            input.locking_script()?,
        )?);
    }

    let mut tx = Transaction::new(
        tx_inputs,
        vec![TxOutput::new(total_input - fee, destination_script)],
    );
    for (index, input) in inputs.iter().enumerate() {
        tx.sign_p2pkh_input(index, &input.key)?;
    }

    Ok(SignedTransaction::finish(tx, fee, 0, None))
}

// =============================================================================
// Tests
// =============================================================================
