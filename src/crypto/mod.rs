//! Cryptographic utilities for the wallet engine
//!
//! This module provides:
//! - SHA-256 / Hash160 hashing
//! - ECDSA key management (secp256k1), WIF and P2PKH addresses
//! - Counterparty child-key derivation

pub mod derivation;
pub mod hash;
pub mod keys;

pub use derivation::{
    derive_child_address, derive_child_private_key, derive_child_public_key, SigningStrategy,
};
pub use hash::{double_sha256, double_sha256_hex, hash160, sha256, sha256_hex};
pub use keys::{
    address_to_pubkey_hash, public_key_from_hex, public_key_to_address, pubkey_hash_to_address,
    secret_key_to_wif, sign_digest, verify_digest, wif_to_secret_key, KeyError, KeyPair,
};
