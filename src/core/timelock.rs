//! Block-height timelock script (OP_PUSH_TX)
//!
//! The locking script has the spender supply the transaction's own
//! signature preimage and checks it is genuine by verifying a signature
//! made with private key 1 and nonce 1 (so `r = Gx` and `s = z + Gx`), which
//! the script can compute itself from the preimage hash. Once the preimage is
//! trusted, the script reads fields straight out of it:
//!
//! ```text
//! unlocking:  <sig> <pubkey> <preimage>
//! locking:    <pkh> <unlockBlock>
//!             nLockTime < 500000000 && nLockTime >= unlockBlock
//!             nSequence != 0xffffffff
//!             HASH160(pubkey) == pkh
//!             preimage signature check (key 1, nonce 1)
//!             CHECKSIG(sig, pubkey)
//! ```
//!
//! The script is a pure function of `(pkh, unlockBlock)` and parses back to
//! exactly those values.

use crate::core::fee::{calculate_unlock_fee, FeeRate};
use crate::core::model::LockedUtxo;
use crate::core::script::opcodes::*;
use crate::core::script::{
    push_bytes, read_instruction, script_from_hex, Instruction, ScriptBuilder, ScriptError,
    SIGHASH_ALL_FORKID,
};
use crate::core::transaction::{
    SignedTransaction, Transaction, TransactionError, TxInput, TxOutput, LOCKTIME_THRESHOLD,
};
use crate::crypto::hash160;
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};

// =============================================================================
// Curve Constants
// =============================================================================

/// x coordinate of the generator point
pub const GX: [u8; 32] = [
    0x79, 0xbe, 0x66, 0x7e, 0xf9, 0xdc, 0xbb, 0xac, 0x55, 0xa0, 0x62, 0x95, 0xce, 0x87, 0x0b, 0x07,
    0x02, 0x9b, 0xfc, 0xdb, 0x2d, 0xce, 0x28, 0xd9, 0x59, 0xf2, 0x81, 0x5b, 0x16, 0xf8, 0x17, 0x98,
];

/// Curve order
pub const N: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe,
    0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48, 0xa0, 0x3b, 0xbf, 0xd2, 0x5e, 0x8c, 0xd0, 0x36, 0x41, 0x41,
];

/// Curve order / 2, the largest low-S value
pub const N_HALF: [u8; 32] = [
    0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0x5d, 0x57, 0x6e, 0x73, 0x57, 0xa4, 0x50, 0x1d, 0xdf, 0xe9, 0x2f, 0x46, 0x68, 0x1b, 0x20, 0xa0,
];

/// 2^248: a 32-byte `s` must not start with a zero byte
const S_MIN: [u8; 32] = {
    let mut bytes = [0u8; 32];
    bytes[0] = 0x01;
    bytes
};

/// Compressed generator point (public key of private key 1)
const G_COMPRESSED: [u8; 33] = [
    0x02, 0x79, 0xbe, 0x66, 0x7e, 0xf9, 0xdc, 0xbb, 0xac, 0x55, 0xa0, 0x62, 0x95, 0xce, 0x87, 0x0b,
    0x07, 0x02, 0x9b, 0xfc, 0xdb, 0x2d, 0xce, 0x28, 0xd9, 0x59, 0xf2, 0x81, 0x5b, 0x16, 0xf8, 0x17,
    0x98,
];

/// First sequence number tried when spending; must stay below final
pub const UNLOCK_SEQUENCE_START: u32 = 0xffff_fffe;

/// Sequence numbers tried before giving up on a low-S preimage signature
const MAX_SEQUENCE_ATTEMPTS: u32 = 4096;

// =============================================================================
// Script Construction
// =============================================================================

/// Parameters embedded in a timelock locking script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelockParams {
    pub unlock_block: u32,
    pub pubkey_hash: [u8; 20],
}

/// `OP_1 OP_SPLIT` x31 then `OP_SWAP OP_CAT` x31: reverse 32 bytes in place
fn reverse_32(builder: ScriptBuilder) -> ScriptBuilder {
    let builder = (0..31).fold(builder, |b, _| b.ops(&[OP_1, OP_SPLIT]));
    (0..31).fold(builder, |b, _| b.ops(&[OP_SWAP, OP_CAT]))
}

/// DER header through the `s` length byte for `r = Gx`
fn der_prefix() -> Vec<u8> {
    let mut prefix = vec![0x30, 0x44, 0x02, 0x20];
    prefix.extend_from_slice(&GX);
    prefix.extend_from_slice(&[0x02, 0x20]);
    prefix
}

/// Everything after the `<pkh> <unlockBlock>` pushes
fn timelock_body() -> Vec<u8> {
    let builder = ScriptBuilder::new()
        .ops(&[OP_SWAP, OP_TOALTSTACK, OP_TOALTSTACK])
        // nLockTime: 4 bytes before the trailing sighash type
        .ops(&[OP_DUP, OP_SIZE, OP_8, OP_SUB, OP_SPLIT, OP_NIP, OP_4, OP_SPLIT, OP_DROP])
        .push_data(&[0x00])
        .ops(&[OP_CAT, OP_BIN2NUM, OP_DUP])
        .push_int(LOCKTIME_THRESHOLD as i64)
        .ops(&[OP_LESSTHAN, OP_VERIFY, OP_FROMALTSTACK, OP_GREATERTHANOREQUAL, OP_VERIFY])
        // nSequence: 44 bytes from the end
        .ops(&[OP_DUP, OP_SIZE])
        .push_int(44)
        .ops(&[OP_SUB, OP_SPLIT, OP_NIP, OP_4, OP_SPLIT, OP_DROP])
        .push_data(&[0xff; 4])
        .ops(&[OP_EQUAL, OP_NOT, OP_VERIFY])
        // Owner
        .ops(&[OP_OVER, OP_HASH160, OP_FROMALTSTACK, OP_EQUALVERIFY])
        // s = (sighash + Gx) mod n, low-S and 32 bytes long
        .ops(&[OP_DUP, OP_HASH256]);
    let builder = reverse_32(builder)
        .push_data(&[0x00])
        .ops(&[OP_CAT, OP_BIN2NUM])
        .push_big_num(&GX)
        .op(OP_ADD)
        .push_big_num(&N)
        .ops(&[OP_MOD, OP_DUP])
        .push_big_num(&N_HALF)
        .ops(&[OP_LESSTHANOREQUAL, OP_VERIFY, OP_DUP])
        .push_big_num(&S_MIN)
        .ops(&[OP_GREATERTHANOREQUAL, OP_VERIFY])
        .push_int(32)
        .op(OP_NUM2BIN);
    reverse_32(builder)
        .push_data(&der_prefix())
        .ops(&[OP_SWAP, OP_CAT])
        .push_data(&[SIGHASH_ALL_FORKID])
        .op(OP_CAT)
        .push_data(&G_COMPRESSED)
        .op(OP_CHECKSIGVERIFY)
        .ops(&[OP_DROP, OP_CHECKSIG])
        .into_bytes()
}

/// Locking script for `(pubkey_hash, unlock_block)`
pub fn create_timelock_script(
    pubkey_hash: &[u8; 20],
    unlock_block: u32,
) -> Result<Vec<u8>, ScriptError> {
    if unlock_block == 0 || unlock_block >= LOCKTIME_THRESHOLD {
        return Err(ScriptError::InvalidHeight(unlock_block));
    }

    let mut script = ScriptBuilder::new()
        .push_data(pubkey_hash)
        .push_int(unlock_block as i64)
        .into_bytes();
    script.extend_from_slice(&timelock_body());
    Ok(script)
}

/// Hex variant of [`create_timelock_script`]
pub fn create_timelock_script_hex(
    pubkey_hash_hex: &str,
    unlock_block: u32,
) -> Result<String, ScriptError> {
    let bytes = script_from_hex(pubkey_hash_hex)?;
    let pubkey_hash: [u8; 20] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| ScriptError::InvalidPubkeyHash(bytes.len()))?;
    Ok(hex::encode(create_timelock_script(&pubkey_hash, unlock_block)?))
}

// =============================================================================
// Script Parsing
// =============================================================================

/// Extract `(unlock_block, pubkey_hash)`; `None` for anything else
pub fn parse_timelock_script(script_hex: &str) -> Option<TimelockParams> {
    parse_timelock_bytes(&hex::decode(script_hex.trim()).ok()?)
}

pub fn parse_timelock_bytes(script: &[u8]) -> Option<TimelockParams> {
    if script.first() != Some(&0x14) {
        return None;
    }
    let (Instruction::Push(pkh), height_at) = read_instruction(script, 0).ok()? else {
        return None;
    };
    let pubkey_hash: [u8; 20] = pkh.try_into().ok()?;

    let (height, body_at) = read_instruction(script, height_at).ok()?;
    let unlock_block = u32::try_from(height.as_script_num()?).ok()?;
    if unlock_block == 0 || unlock_block >= LOCKTIME_THRESHOLD {
        return None;
    }

    // Heights must use the same minimal push the builder emits
    let canonical = ScriptBuilder::new().push_int(unlock_block as i64).into_bytes();
    if script[height_at..body_at] != canonical[..] || script[body_at..] != timelock_body()[..] {
        return None;
    }

    Some(TimelockParams {
        unlock_block,
        pubkey_hash,
    })
}

/// Whether a script is a timelock locking script
pub fn is_timelock_script(script: &[u8]) -> bool {
    parse_timelock_bytes(script).is_some()
}

// =============================================================================
// Unlock Transaction
// =============================================================================

/// The `s` the script will derive from `digest`, if it passes its range checks
fn preimage_signature_s(digest: [u8; 32]) -> Option<[u8; 32]> {
    let z = Scalar::from_be_bytes(digest).ok()?;
    let s = SecretKey::from_slice(&GX).ok()?.add_tweak(&z).ok()?.secret_bytes();
    (s >= S_MIN && s <= N_HALF).then_some(s)
}

/// Spend a matured lock back to `destination_script`
///
/// Sets nLockTime to the unlock height, then walks the input sequence down
/// from `0xfffffffe` until the preimage hash produces an `s` the locking
/// script accepts. The fee is sized from the actual locking script length.
pub fn build_unlock_transaction(
    locked: &LockedUtxo,
    key: &SecretKey,
    destination_script: Vec<u8>,
    fee_rate: FeeRate,
    current_height: u32,
) -> Result<SignedTransaction, TransactionError> {
    if current_height < locked.unlock_block {
        return Err(TransactionError::LockNotSpendable {
            blocks_remaining: locked.blocks_remaining(current_height),
        });
    }

    let locking_script = script_from_hex(&locked.utxo.locking_script_hex)?;
    let params = parse_timelock_bytes(&locking_script).ok_or(ScriptError::NotTimelock)?;

    let secp = Secp256k1::signing_only();
    let public_key = PublicKey::from_secret_key(&secp, key).serialize();
    if hash160(&public_key) != params.pubkey_hash {
        return Err(TransactionError::KeyMismatch(locked.outpoint()));
    }
    if current_height < params.unlock_block {
        return Err(TransactionError::LockNotSpendable {
            blocks_remaining: params.unlock_block - current_height,
        });
    }

    let fee = calculate_unlock_fee(locking_script.len(), fee_rate);
    let satoshis = locked.utxo.satoshis;
    if satoshis <= fee {
        return Err(TransactionError::InsufficientFunds {
            required: fee + 1,
            available: satoshis,
        });
    }

    let input = TxInput::new(&locked.utxo.txid, locked.utxo.vout, satoshis, locking_script)?;
    let mut tx = Transaction::new(
        vec![input],
        vec![TxOutput::new(satoshis - fee, destination_script)],
    );
    tx.locktime = params.unlock_block;

    let mut found = false;
    for offset in 0..MAX_SEQUENCE_ATTEMPTS {
        tx.inputs[0].sequence = UNLOCK_SEQUENCE_START - offset;
        if preimage_signature_s(tx.sighash(0)?).is_some() {
            found = true;
            break;
        }
    }
    if !found {
        return Err(TransactionError::NoValidSequence);
    }

    let preimage = tx.sighash_preimage(0)?;
    let signature = tx.signature_for(0, key)?;
    let mut unlocking = push_bytes(&signature);
    unlocking.extend_from_slice(&push_bytes(&public_key));
    unlocking.extend_from_slice(&push_bytes(&preimage));
    tx.inputs[0].unlocking_script = unlocking;

    Ok(SignedTransaction::finish(tx, fee, 0, None))
}

// =============================================================================
// Tests
// =============================================================================
