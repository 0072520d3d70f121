//! Fee Model
//!
//! Size-based fee arithmetic for standard, lock and unlock transactions:
//! - Fee rates in satoshis per 1000 bytes (integer, no float rounding)
//! - Change planning (with or without a change output)
//! - Maximum sendable amount and exact fee for an amount
//! - Cached network fee quotes with a TTL

use crate::core::model::Utxo;
use crate::core::selection::unique_utxos;
use crate::core::transaction::varint_len;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

// =============================================================================
// Constants
// =============================================================================

/// Version, input/output counts and lock time
pub const BASE_TX_BYTES: u64 = 10;

/// Outpoint, P2PKH scriptSig and sequence
pub const AVG_INPUT_BYTES: u64 = 148;

/// Value and P2PKH locking script
pub const AVG_OUTPUT_BYTES: u64 = 34;

/// Default fee rate: 100 sat/kB (0.1 sat/byte)
pub const DEFAULT_FEE_RATE: FeeRate = FeeRate(100);

/// Lowest rate accepted from users or the network
pub const MIN_FEE_RATE: FeeRate = FeeRate(1);

/// Highest rate accepted from users or the network
pub const MAX_FEE_RATE: FeeRate = FeeRate(1_000);

/// How long a network fee quote stays valid
pub const DEFAULT_FEE_QUOTE_TTL: Duration = Duration::from_secs(300);

/// Worst-case DER signature plus sighash byte, with its push opcode
const MAX_SIGNATURE_PUSH_BYTES: u64 = 1 + 73;

/// Compressed public key with its push opcode
const PUBKEY_PUSH_BYTES: u64 = 1 + 33;

/// Preimage fields other than the script code
const PREIMAGE_FIXED_BYTES: u64 = 156;

// =============================================================================
// Fee Rate
// =============================================================================

/// Fee rate in satoshis per 1000 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeeRate(pub u64);

impl FeeRate {
    /// Create from satoshis per kilobyte
    pub fn from_sat_per_kb(rate: u64) -> Self {
        Self(rate)
    }

    /// Create from a (possibly fractional) satoshis-per-byte figure
    pub fn from_sat_per_byte(rate: f64) -> Self {
        if !rate.is_finite() || rate <= 0.0 {
            return Self(0);
        }
        Self((rate * 1000.0).round() as u64)
    }

    /// Calculate fee for a given size: `ceil(size * rate)`, at least 1 sat
    pub fn fee_for_size(&self, size_bytes: u64) -> u64 {
        let fee = (size_bytes * self.0).div_ceil(1000);
        fee.max(1)
    }

    /// Get rate as satoshis per byte
    pub fn as_sat_per_byte(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    pub fn as_sat_per_kb(&self) -> u64 {
        self.0
    }

    /// Restrict into `[min, max]`
    pub fn clamp_to(self, min: FeeRate, max: FeeRate) -> Self {
        Self(self.0.clamp(min.0, max.0))
    }
}

impl Default for FeeRate {
    fn default() -> Self {
        DEFAULT_FEE_RATE
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat/kB", self.0)
    }
}

// =============================================================================
// Size & Fee Functions
// =============================================================================

/// Fee in satoshis for `size_bytes` at `rate`
pub fn fee_from_bytes(size_bytes: u64, rate: FeeRate) -> u64 {
    rate.fee_for_size(size_bytes)
}

/// Estimated size of a P2PKH transaction
pub fn estimate_tx_size(num_inputs: usize, num_outputs: usize, extra_bytes: u64) -> u64 {
    BASE_TX_BYTES
        + num_inputs as u64 * AVG_INPUT_BYTES
        + num_outputs as u64 * AVG_OUTPUT_BYTES
        + extra_bytes
}

/// Fee for a P2PKH transaction with the given input/output counts
pub fn calculate_tx_fee(
    num_inputs: usize,
    num_outputs: usize,
    extra_bytes: u64,
    rate: FeeRate,
) -> u64 {
    fee_from_bytes(estimate_tx_size(num_inputs, num_outputs, extra_bytes), rate)
}

/// Serialized size of an output carrying a script of `script_len` bytes
pub fn output_bytes(script_len: usize) -> u64 {
    8 + varint_len(script_len as u64) + script_len as u64
}

/// Bytes an output adds beyond the standard P2PKH estimate
pub fn script_extra_bytes(script_len: usize) -> u64 {
    output_bytes(script_len).saturating_sub(AVG_OUTPUT_BYTES)
}

/// Fee for a lock transaction: timelock output plus a change output
///
/// `op_return_extra_bytes` is the full serialized size of any extra data
/// output.
pub fn calculate_lock_fee(
    num_inputs: usize,
    timelock_script_bytes: usize,
    op_return_extra_bytes: u64,
    rate: FeeRate,
) -> u64 {
    let size = BASE_TX_BYTES
        + num_inputs as u64 * AVG_INPUT_BYTES
        + output_bytes(timelock_script_bytes)
        + AVG_OUTPUT_BYTES
        + op_return_extra_bytes;
    fee_from_bytes(size, rate)
}

/// Size of the input spending a timelock output whose script is `locking_script_len` bytes
///
/// The unlocking script carries the whole signature preimage, which itself
/// embeds the locking script, so the input grows with the script.
pub fn unlock_input_bytes(locking_script_len: usize) -> u64 {
    let script_len = locking_script_len as u64;
    let preimage_len = PREIMAGE_FIXED_BYTES + varint_len(script_len) + script_len;
    let unlocking_len =
        MAX_SIGNATURE_PUSH_BYTES + PUBKEY_PUSH_BYTES + push_prefix_len(preimage_len) + preimage_len;
    32 + 4 + varint_len(unlocking_len) + unlocking_len + 4
}

/// Fee for a one-input, one-output unlock transaction
pub fn calculate_unlock_fee(locking_script_len: usize, rate: FeeRate) -> u64 {
    let size = BASE_TX_BYTES + unlock_input_bytes(locking_script_len) + AVG_OUTPUT_BYTES;
    fee_from_bytes(size, rate)
}

fn push_prefix_len(data_len: u64) -> u64 {
    match data_len {
        0..=75 => 1,
        76..=0xff => 2,
        0x100..=0xffff => 3,
        _ => 5,
    }
}

// =============================================================================
// Change Planning
// =============================================================================

/// Fee and change for a fixed set of inputs and outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangePlan {
    pub fee: u64,
    /// Zero when no change output is added
    pub change: u64,
}

impl ChangePlan {
    pub fn has_change(&self) -> bool {
        self.change > 0
    }
}

/// Funds missing to cover outputs plus fee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortfall {
    pub required: u64,
    pub available: u64,
}

/// Decide fee and change for `num_inputs` inputs funding `total_output`
///
/// `num_outputs` excludes the change output. A change output is added
/// whenever something is left after paying the fee for it; otherwise any
/// remainder goes to the miner.
pub fn plan_change(
    total_input: u64,
    total_output: u64,
    num_inputs: usize,
    num_outputs: usize,
    extra_bytes: u64,
    rate: FeeRate,
) -> Result<ChangePlan, Shortfall> {
    let fee_with_change = calculate_tx_fee(num_inputs, num_outputs + 1, extra_bytes, rate);
    if let Some(change) = total_input
        .checked_sub(total_output)
        .and_then(|v| v.checked_sub(fee_with_change))
        .filter(|change| *change > 0)
    {
        return Ok(ChangePlan {
            fee: fee_with_change,
            change,
        });
    }

    let fee = calculate_tx_fee(num_inputs, num_outputs, extra_bytes, rate);
    let required = total_output.saturating_add(fee);
    if total_input < required {
        return Err(Shortfall {
            required,
            available: total_input,
        });
    }

    Ok(ChangePlan {
        fee: total_input - total_output,
        change: 0,
    })
}

// =============================================================================
// Wallet Queries
// =============================================================================

/// Largest single-output send from a UTXO set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaxSend {
    pub max_sats: u64,
    pub fee: u64,
    pub num_inputs: usize,
}

/// Spend every UTXO into one output, no change
pub fn calculate_max_send(utxos: &[Utxo], rate: FeeRate) -> MaxSend {
    let unique = unique_utxos(utxos);
    if unique.is_empty() {
        return MaxSend::default();
    }

    let total: u64 = unique.iter().map(|u| u.satoshis).sum();
    let fee = calculate_tx_fee(unique.len(), 1, 0, rate);
    MaxSend {
        max_sats: total.saturating_sub(fee),
        fee,
        num_inputs: unique.len(),
    }
}

/// Fee quote for sending a specific amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactFee {
    pub fee: u64,
    pub can_send: bool,
    pub num_inputs: usize,
    pub total_input: u64,
    pub change: u64,
}

/// Greedily add inputs until `amount` plus the running fee is covered
pub fn calculate_exact_fee(amount: u64, utxos: &[Utxo], rate: FeeRate) -> ExactFee {
    let unique = unique_utxos(utxos);
    if amount == 0 || unique.is_empty() {
        return ExactFee::default();
    }

    let mut total_input = 0u64;
    for (index, utxo) in unique.iter().enumerate() {
        total_input = total_input.saturating_add(utxo.satoshis);
        if let Ok(plan) = plan_change(total_input, amount, index + 1, 1, 0, rate) {
            return ExactFee {
                fee: plan.fee,
                can_send: true,
                num_inputs: index + 1,
                total_input,
                change: plan.change,
            };
        }
    }

    ExactFee {
        fee: calculate_tx_fee(unique.len(), 1, 0, rate),
        can_send: false,
        num_inputs: unique.len(),
        total_input,
        change: 0,
    }
}

// =============================================================================
// Fee Quote Cache
// =============================================================================

/// Last network fee quote and when it was fetched
#[derive(Debug, Clone)]
pub struct FeeRateCache {
    quote: Option<(FeeRate, Instant)>,
    ttl: Duration,
}

impl FeeRateCache {
    pub fn new(ttl: Duration) -> Self {
        Self { quote: None, ttl }
    }

    /// Cached quote if it is younger than the TTL
    pub fn fresh(&self) -> Option<FeeRate> {
        match self.quote {
            Some((rate, fetched)) if fetched.elapsed() < self.ttl => Some(rate),
            _ => None,
        }
    }

    pub fn store(&mut self, rate: FeeRate) {
        self.quote = Some((rate, Instant::now()));
    }

    pub fn clear(&mut self) {
        self.quote = None;
    }
}

impl Default for FeeRateCache {
    fn default() -> Self {
        Self::new(DEFAULT_FEE_QUOTE_TTL)
    }
}

// =============================================================================
// Tests
// =============================================================================
