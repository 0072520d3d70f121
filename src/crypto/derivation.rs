//! Counterparty key derivation
//!
//! Derives per-counterparty child keys from an identity key, the other
//! party's public key and an invoice number:
//!
//! ```text
//! shared  = counterparty_pub * identity_priv          (ECDH point, compressed)
//! tweak   = HMAC-SHA256(key = shared, msg = invoice)
//! child   = identity_priv + tweak  (mod n)
//! ```
//!
//! The payer, knowing only its own private key and the wallet's identity
//! public key, reaches the same shared point and computes
//! `identity_pub + tweak * G`, the public half of the same child key.

use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::keys::{public_key_from_hex, public_key_to_address, wif_to_secret_key, KeyError};

type HmacSha256 = Hmac<Sha256>;

/// Private key for `identity` in its relationship with `counterparty`
pub fn derive_child_private_key(
    identity: &SecretKey,
    counterparty: &PublicKey,
    invoice_number: &str,
) -> Result<SecretKey, KeyError> {
    let tweak = invoice_tweak(identity, counterparty, invoice_number)?;
    identity
        .add_tweak(&tweak)
        .map_err(|e| KeyError::Derivation(e.to_string()))
}

/// Public key the payer derives for the wallet's `identity` public key
pub fn derive_child_public_key(
    own: &SecretKey,
    identity: &PublicKey,
    invoice_number: &str,
) -> Result<PublicKey, KeyError> {
    let secp = Secp256k1::verification_only();
    let tweak = invoice_tweak(own, identity, invoice_number)?;
    identity
        .add_exp_tweak(&secp, &tweak)
        .map_err(|e| KeyError::Derivation(e.to_string()))
}

/// Receiving address of the child key owned by `identity`
pub fn derive_child_address(
    identity: &SecretKey,
    counterparty: &PublicKey,
    invoice_number: &str,
) -> Result<String, KeyError> {
    let secp = Secp256k1::signing_only();
    let child = derive_child_private_key(identity, counterparty, invoice_number)?;
    Ok(public_key_to_address(&PublicKey::from_secret_key(
        &secp, &child,
    )))
}

fn invoice_tweak(
    secret: &SecretKey,
    public: &PublicKey,
    invoice_number: &str,
) -> Result<Scalar, KeyError> {
    let secp = Secp256k1::verification_only();
    let shared = public
        .mul_tweak(&secp, &Scalar::from(*secret))
        .map_err(|e| KeyError::Derivation(e.to_string()))?;

    let mut mac = HmacSha256::new_from_slice(&shared.serialize())
        .map_err(|e| KeyError::Derivation(e.to_string()))?;
    mac.update(invoice_number.as_bytes());
    let digest: [u8; 32] = mac.finalize().into_bytes().into();

    Scalar::from_be_bytes(digest)
        .map_err(|_| KeyError::Derivation("tweak out of range".to_string()))
}

// =============================================================================
// Signing Strategy
// =============================================================================

/// How the key for one transaction input is obtained
///
/// Resolved once per input before the transaction is assembled, so the
/// builder only ever sees concrete secret keys.
pub enum SigningStrategy {
    /// Output owned directly by a key the key store hands out
    OwnerKey(Zeroizing<String>),
    /// Output owned by a counterparty-derived key, recomputed on demand
    DerivedKey {
        identity_wif: Zeroizing<String>,
        counterparty_pubkey: String,
        invoice_number: String,
    },
}

impl SigningStrategy {
    pub fn resolve(&self) -> Result<SecretKey, KeyError> {
        match self {
            SigningStrategy::OwnerKey(wif) => wif_to_secret_key(wif),
            SigningStrategy::DerivedKey {
                identity_wif,
                counterparty_pubkey,
                invoice_number,
            } => {
                let identity = wif_to_secret_key(identity_wif)?;
                let counterparty = public_key_from_hex(counterparty_pubkey)?;
                derive_child_private_key(&identity, &counterparty, invoice_number)
            }
        }
    }
}

impl std::fmt::Debug for SigningStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningStrategy::OwnerKey(_) => f.write_str("OwnerKey(..)"),
            SigningStrategy::DerivedKey {
                counterparty_pubkey,
                invoice_number,
                ..
            } => f
                .debug_struct("DerivedKey")
                .field("counterparty_pubkey", counterparty_pubkey)
                .field("invoice_number", invoice_number)
                .finish_non_exhaustive(),
        }
    }
}
