//! Script primitives
//!
//! Opcode constants, minimal push-data and script-number encoding, a
//! builder and reader for raw scripts, and the standard P2PKH and
//! OP_RETURN output scripts.

use crate::crypto::keys::{address_to_pubkey_hash, KeyError};
use thiserror::Error;

// =============================================================================
// Script Errors
// =============================================================================

/// Script-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Invalid script hex: {0}")]
    InvalidHex(String),
    #[error("Invalid public key hash length: {0} bytes")]
    InvalidPubkeyHash(usize),
    #[error("Invalid unlock height: {0}")]
    InvalidHeight(u32),
    #[error("Truncated push at offset {0}")]
    TruncatedPush(usize),
    #[error("Not a timelock script")]
    NotTimelock,
    #[error("Address error: {0}")]
    Address(#[from] KeyError),
}

// =============================================================================
// Opcodes
// =============================================================================

pub mod opcodes {
    pub const OP_0: u8 = 0x00;
    pub const OP_FALSE: u8 = OP_0;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_1NEGATE: u8 = 0x4f;
    pub const OP_1: u8 = 0x51;
    pub const OP_4: u8 = 0x54;
    pub const OP_8: u8 = 0x58;
    pub const OP_16: u8 = 0x60;
    pub const OP_VERIFY: u8 = 0x69;
    pub const OP_RETURN: u8 = 0x6a;
    pub const OP_TOALTSTACK: u8 = 0x6b;
    pub const OP_FROMALTSTACK: u8 = 0x6c;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_NIP: u8 = 0x77;
    pub const OP_OVER: u8 = 0x78;
    pub const OP_SWAP: u8 = 0x7c;
    pub const OP_CAT: u8 = 0x7e;
    pub const OP_SPLIT: u8 = 0x7f;
    pub const OP_NUM2BIN: u8 = 0x80;
    pub const OP_BIN2NUM: u8 = 0x81;
    pub const OP_SIZE: u8 = 0x82;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_NOT: u8 = 0x91;
    pub const OP_ADD: u8 = 0x93;
    pub const OP_SUB: u8 = 0x94;
    pub const OP_MOD: u8 = 0x97;
    pub const OP_LESSTHAN: u8 = 0x9f;
    pub const OP_LESSTHANOREQUAL: u8 = 0xa1;
    pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_HASH256: u8 = 0xaa;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKSIGVERIFY: u8 = 0xad;
}

use opcodes::*;

/// SIGHASH_ALL with the fork-id flag
pub const SIGHASH_ALL_FORKID: u8 = 0x41;

// =============================================================================
// Script Numbers
// =============================================================================

/// Minimal little-endian sign-magnitude encoding
pub fn encode_script_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }

    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    let mut bytes = Vec::with_capacity(9);
    while magnitude > 0 {
        bytes.push((magnitude & 0xff) as u8);
        magnitude >>= 8;
    }

    if bytes.last().is_some_and(|b| b & 0x80 != 0) {
        bytes.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        if let Some(last) = bytes.last_mut() {
            *last |= 0x80;
        }
    }
    bytes
}

/// Decode a minimally-encoded script number of at most 8 bytes
pub fn decode_script_num(bytes: &[u8]) -> Option<i64> {
    let Some((&last, rest)) = bytes.split_last() else {
        return Some(0);
    };
    if bytes.len() > 8 {
        return None;
    }
    // A trailing sign byte is only allowed when the byte before needs it
    if last & 0x7f == 0 && rest.last().map_or(true, |b| b & 0x80 == 0) {
        return None;
    }

    let mut magnitude: i64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        let byte = if i == bytes.len() - 1 { byte & 0x7f } else { *byte };
        magnitude |= (byte as i64) << (8 * i);
    }
    Some(if last & 0x80 != 0 { -magnitude } else { magnitude })
}

/// Script-number bytes of a big-endian unsigned integer
///
/// Used for 256-bit curve constants that do not fit `i64`.
pub fn script_num_from_be(be_bytes: &[u8]) -> Vec<u8> {
    let mut bytes: Vec<u8> = be_bytes.iter().rev().copied().collect();
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    if bytes.last().is_some_and(|b| b & 0x80 != 0) {
        bytes.push(0x00);
    }
    bytes
}

// =============================================================================
// Script Builder
// =============================================================================

/// Append-only builder for raw script bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptBuilder {
    bytes: Vec<u8>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(mut self, opcode: u8) -> Self {
        self.bytes.push(opcode);
        self
    }

    pub fn ops(mut self, opcodes: &[u8]) -> Self {
        self.bytes.extend_from_slice(opcodes);
        self
    }

    /// Push data with the smallest encoding
    ///
    /// Empty data becomes OP_0, single bytes 1..=16 become OP_1..OP_16 and
    /// 0x81 becomes OP_1NEGATE.
    pub fn push_data(mut self, data: &[u8]) -> Self {
        match data {
            [] => self.bytes.push(OP_0),
            [n @ 1..=16] => self.bytes.push(OP_1 + n - 1),
            [0x81] => self.bytes.push(OP_1NEGATE),
            _ => {
                push_prefix(&mut self.bytes, data.len());
                self.bytes.extend_from_slice(data);
            }
        }
        self
    }

    pub fn push_int(self, value: i64) -> Self {
        self.push_data(&encode_script_num(value))
    }

    /// Push a big-endian unsigned constant as a script number
    pub fn push_big_num(self, be_bytes: &[u8]) -> Self {
        self.push_data(&script_num_from_be(be_bytes))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Write the length prefix for a direct or PUSHDATA push of `len` bytes
fn push_prefix(out: &mut Vec<u8>, len: usize) {
    if len < OP_PUSHDATA1 as usize {
        out.push(len as u8);
    } else if len <= 0xff {
        out.push(OP_PUSHDATA1);
        out.push(len as u8);
    } else if len <= 0xffff {
        out.push(OP_PUSHDATA2);
        out.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        out.push(OP_PUSHDATA4);
        out.extend_from_slice(&(len as u32).to_le_bytes());
    }
}

/// Raw push of `data` with its length prefix, never folded into a small-int opcode
pub fn push_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 5);
    push_prefix(&mut out, data.len());
    out.extend_from_slice(data);
    out
}

// =============================================================================
// Script Reader
// =============================================================================

/// One parsed script element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction<'a> {
    Op(u8),
    Push(&'a [u8]),
}

impl Instruction<'_> {
    /// Value of a small-int opcode or pushed script number
    pub fn as_script_num(&self) -> Option<i64> {
        match *self {
            Instruction::Op(OP_0) => Some(0),
            Instruction::Op(OP_1NEGATE) => Some(-1),
            Instruction::Op(op @ OP_1..=OP_16) => Some((op - OP_1 + 1) as i64),
            Instruction::Push(data) => decode_script_num(data),
            Instruction::Op(_) => None,
        }
    }
}

/// Read the instruction at `pos`, returning it with the offset that follows
pub fn read_instruction(script: &[u8], pos: usize) -> Result<(Instruction<'_>, usize), ScriptError> {
    let opcode = *script.get(pos).ok_or(ScriptError::TruncatedPush(pos))?;
    let (len, start) = match opcode {
        0x01..=0x4b => (opcode as usize, pos + 1),
        OP_PUSHDATA1 => (read_le(script, pos + 1, 1)?, pos + 2),
        OP_PUSHDATA2 => (read_le(script, pos + 1, 2)?, pos + 3),
        OP_PUSHDATA4 => (read_le(script, pos + 1, 4)?, pos + 5),
        _ => return Ok((Instruction::Op(opcode), pos + 1)),
    };
    let data = script
        .get(start..start + len)
        .ok_or(ScriptError::TruncatedPush(pos))?;
    Ok((Instruction::Push(data), start + len))
}

fn read_le(script: &[u8], start: usize, width: usize) -> Result<usize, ScriptError> {
    let bytes = script
        .get(start..start + width)
        .ok_or(ScriptError::TruncatedPush(start))?;
    Ok(bytes
        .iter()
        .rev()
        .fold(0usize, |acc, b| (acc << 8) | *b as usize))
}

/// Parse a whole script into instructions
pub fn parse_script(script: &[u8]) -> Result<Vec<Instruction<'_>>, ScriptError> {
    let mut instructions = Vec::new();
    let mut pos = 0;
    while pos < script.len() {
        let (instruction, next) = read_instruction(script, pos)?;
        instructions.push(instruction);
        pos = next;
    }
    Ok(instructions)
}

// =============================================================================
// Standard Scripts
// =============================================================================

/// `OP_DUP OP_HASH160 <pkh> OP_EQUALVERIFY OP_CHECKSIG`
pub fn p2pkh_locking_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[OP_DUP, OP_HASH160, 0x14]);
    script.extend_from_slice(pubkey_hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

/// P2PKH locking script paying a mainnet address
pub fn locking_script_for_address(address: &str) -> Result<Vec<u8>, ScriptError> {
    Ok(p2pkh_locking_script(&address_to_pubkey_hash(address)?))
}

/// Public key hash paid by a P2PKH locking script, if it is one
pub fn p2pkh_pubkey_hash(script: &[u8]) -> Option<[u8; 20]> {
    match script {
        [OP_DUP, OP_HASH160, 0x14, pkh @ .., OP_EQUALVERIFY, OP_CHECKSIG] if pkh.len() == 20 => {
            let mut out = [0u8; 20];
            out.copy_from_slice(pkh);
            Some(out)
        }
        _ => None,
    }
}

/// `<signature+sighash> <pubkey>`
pub fn p2pkh_unlocking_script(signature: &[u8], public_key: &[u8]) -> Vec<u8> {
    let mut script = push_bytes(signature);
    script.extend_from_slice(&push_bytes(public_key));
    script
}

/// `OP_FALSE OP_RETURN <chunk>...` data carrier
pub fn op_return_script(chunks: &[&[u8]]) -> Vec<u8> {
    let mut script = vec![OP_FALSE, OP_RETURN];
    for chunk in chunks {
        script.extend_from_slice(&push_bytes(chunk));
    }
    script
}

/// Decode script hex, mapping failures to a script error
pub fn script_from_hex(script_hex: &str) -> Result<Vec<u8>, ScriptError> {
    hex::decode(script_hex.trim()).map_err(|e| ScriptError::InvalidHex(e.to_string()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_num_encoding() {
        assert_eq!(encode_script_num(0), Vec::<u8>::new());
        assert_eq!(encode_script_num(1), vec![0x01]);
        assert_eq!(encode_script_num(-1), vec![0x81]);
        assert_eq!(encode_script_num(127), vec![0x7f]);
        assert_eq!(encode_script_num(128), vec![0x80, 0x00]);
        assert_eq!(encode_script_num(-128), vec![0x80, 0x80]);
        assert_eq!(encode_script_num(900_000), vec![0xa0, 0xbb, 0x0d]);
        assert_eq!(encode_script_num(500_000_000), vec![0x00, 0x65, 0xcd, 0x1d]);
    }

    #[test]
    fn test_script_num_decoding() {
        for value in [0, 1, -1, 16, 127, 128, -255, 65_535, 900_000, 4_294_967_295] {
            assert_eq!(decode_script_num(&encode_script_num(value)), Some(value));
        }
        // Padded encodings are rejected
        assert_eq!(decode_script_num(&[0x01, 0x00]), None);
        assert_eq!(decode_script_num(&[0x00]), None);
        assert_eq!(decode_script_num(&[0x80]), None);
        assert_eq!(decode_script_num(&[0x01; 9]), None);
    }

    #[test]
    fn test_script_num_from_be() {
        assert_eq!(script_num_from_be(&[0x00, 0x00, 0x01]), vec![0x01]);
        assert_eq!(script_num_from_be(&[0x80]), vec![0x80, 0x00]);
        assert_eq!(script_num_from_be(&[0x01, 0x00]), vec![0x00, 0x01]);
        assert!(script_num_from_be(&[0, 0]).is_empty());
    }

    #[test]
    fn test_minimal_push() {
        assert_eq!(ScriptBuilder::new().push_data(&[]).into_bytes(), vec![OP_0]);
        assert_eq!(ScriptBuilder::new().push_data(&[5]).into_bytes(), vec![0x55]);
        assert_eq!(ScriptBuilder::new().push_data(&[16]).into_bytes(), vec![OP_16]);
        assert_eq!(ScriptBuilder::new().push_data(&[0x81]).into_bytes(), vec![OP_1NEGATE]);
        assert_eq!(ScriptBuilder::new().push_data(&[17]).into_bytes(), vec![0x01, 17]);
        assert_eq!(ScriptBuilder::new().push_data(&[0]).into_bytes(), vec![0x01, 0x00]);

        let data = vec![0xab; 80];
        let pushed = ScriptBuilder::new().push_data(&data).into_bytes();
        assert_eq!(&pushed[..2], &[OP_PUSHDATA1, 80]);
        assert_eq!(pushed.len(), 82);

        let data = vec![0xab; 300];
        let pushed = ScriptBuilder::new().push_data(&data).into_bytes();
        assert_eq!(&pushed[..3], &[OP_PUSHDATA2, 0x2c, 0x01]);
    }

    #[test]
    fn test_read_instructions() {
        let script = ScriptBuilder::new()
            .push_data(&[0xaa; 20])
            .push_int(900_000)
            .push_int(3)
            .op(OP_CHECKSIG)
            .push_data(&[0xcd; 300])
            .into_bytes();

        let parsed = parse_script(&script).unwrap();
        assert_eq!(parsed.len(), 5);
        assert_eq!(parsed[0], Instruction::Push(&[0xaa; 20]));
        assert_eq!(parsed[1].as_script_num(), Some(900_000));
        assert_eq!(parsed[2].as_script_num(), Some(3));
        assert_eq!(parsed[3], Instruction::Op(OP_CHECKSIG));
        assert!(matches!(parsed[4], Instruction::Push(d) if d.len() == 300));
    }

    #[test]
    fn test_truncated_push_rejected() {
        assert_eq!(
            parse_script(&[0x14, 0x01, 0x02]),
            Err(ScriptError::TruncatedPush(0))
        );
        assert!(parse_script(&[OP_PUSHDATA2, 0x01]).is_err());
    }

    #[test]
    fn test_p2pkh_script() {
        let script = locking_script_for_address("1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH").unwrap();
        assert_eq!(
            hex::encode(&script),
            "76a914751e76e8199196d454941c45d1b3a323f1433bd688ac"
        );
        assert_eq!(
            p2pkh_pubkey_hash(&script).map(hex::encode),
            Some("751e76e8199196d454941c45d1b3a323f1433bd6".to_string())
        );
        assert!(locking_script_for_address("mipcBbFg9gMiCh81Kj8tqqdgoZub1ZJRfn").is_err());
    }

    #[test]
    fn test_op_return_script() {
        let script = op_return_script(&[b"lock".as_slice(), b"origin_0".as_slice()]);
        assert_eq!(&script[..2], &[OP_FALSE, OP_RETURN]);
        assert_eq!(script[2], 4);
        assert_eq!(&script[3..7], b"lock");
        assert_eq!(script.len(), 2 + 5 + 9);
    }
}
