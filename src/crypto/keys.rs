//! ECDSA key management
//!
//! Key pairs, WIF import/export, compressed public keys and mainnet
//! P2PKH addresses on the secp256k1 curve.

use rand::rngs::OsRng;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;
use zeroize::Zeroize;

use super::hash::hash160;

/// WIF version byte for mainnet private keys
pub const WIF_PREFIX: u8 = 0x80;

/// Address version byte for mainnet P2PKH
pub const P2PKH_ADDRESS_PREFIX: u8 = 0x00;

/// Suffix marking a WIF as belonging to a compressed public key
const WIF_COMPRESSED_FLAG: u8 = 0x01;

/// Errors that can occur during key operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid WIF: {0}")]
    InvalidWif(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid address prefix: expected 0x00 (P2PKH mainnet), got 0x{0:02x}")]
    WrongNetwork(u8),
    #[error("Key derivation failed: {0}")]
    Derivation(String),
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from a WIF string
    pub fn from_wif(wif: &str) -> Result<Self, KeyError> {
        Ok(Self::from_secret_key(wif_to_secret_key(wif)?))
    }

    /// Export the private key as compressed mainnet WIF
    pub fn to_wif(&self) -> String {
        secret_key_to_wif(&self.secret_key)
    }

    /// Get the public key as a hex string (compressed format)
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// RIPEMD160(SHA256(compressed public key))
    pub fn public_key_hash(&self) -> [u8; 20] {
        hash160(&self.public_key.serialize())
    }

    /// Mainnet P2PKH address of this key
    pub fn address(&self) -> String {
        public_key_to_address(&self.public_key)
    }

    /// Sign a 32-byte digest, returning a DER-encoded low-S signature
    pub fn sign_digest(&self, digest: [u8; 32]) -> Vec<u8> {
        sign_digest(&self.secret_key, digest)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Decode a WIF (mainnet, compressed or uncompressed payload) into a secret key
pub fn wif_to_secret_key(wif: &str) -> Result<SecretKey, KeyError> {
    let mut decoded = bs58::decode(wif.trim())
        .with_check(None)
        .into_vec()
        .map_err(|e| KeyError::InvalidWif(e.to_string()))?;

    let result = match decoded.as_slice() {
        [WIF_PREFIX, key @ .., WIF_COMPRESSED_FLAG] if key.len() == 32 => {
            SecretKey::from_slice(key).map_err(|_| KeyError::InvalidPrivateKey)
        }
        [WIF_PREFIX, key @ ..] if key.len() == 32 => {
            SecretKey::from_slice(key).map_err(|_| KeyError::InvalidPrivateKey)
        }
        [WIF_PREFIX, ..] => Err(KeyError::InvalidWif(format!(
            "invalid length: {}",
            decoded.len()
        ))),
        _ => Err(KeyError::InvalidWif("invalid prefix".to_string())),
    };

    decoded.zeroize();
    result
}

/// Encode a secret key as compressed mainnet WIF
///
/// Format: Base58Check( 0x80 || key || 0x01 )
pub fn secret_key_to_wif(secret_key: &SecretKey) -> String {
    let mut payload = Vec::with_capacity(34);
    payload.push(WIF_PREFIX);
    payload.extend_from_slice(&secret_key.secret_bytes());
    payload.push(WIF_COMPRESSED_FLAG);
    let wif = bs58::encode(&payload).with_check().into_string();
    payload.zeroize();
    wif
}

/// Convert a public key to a mainnet P2PKH address
pub fn public_key_to_address(public_key: &PublicKey) -> String {
    pubkey_hash_to_address(&hash160(&public_key.serialize()))
}

/// Base58Check( 0x00 || pubkey_hash )
pub fn pubkey_hash_to_address(pubkey_hash: &[u8; 20]) -> String {
    let mut payload = Vec::with_capacity(21);
    payload.push(P2PKH_ADDRESS_PREFIX);
    payload.extend_from_slice(pubkey_hash);
    bs58::encode(payload).with_check().into_string()
}

/// Extract the public key hash from a mainnet P2PKH address
pub fn address_to_pubkey_hash(address: &str) -> Result<[u8; 20], KeyError> {
    let decoded = bs58::decode(address.trim())
        .with_check(None)
        .into_vec()
        .map_err(|e| KeyError::InvalidAddress(e.to_string()))?;

    if decoded.len() != 21 {
        return Err(KeyError::InvalidAddress(format!(
            "invalid length: {}",
            decoded.len()
        )));
    }
    if decoded[0] != P2PKH_ADDRESS_PREFIX {
        return Err(KeyError::WrongNetwork(decoded[0]));
    }

    let mut pkh = [0u8; 20];
    pkh.copy_from_slice(&decoded[1..]);
    Ok(pkh)
}

/// Parse a public key from hex string
pub fn public_key_from_hex(hex_key: &str) -> Result<PublicKey, KeyError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|_| KeyError::InvalidPublicKey)?;
    PublicKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPublicKey)
}

/// Sign a 32-byte digest with a secret key (DER, low-S)
pub fn sign_digest(secret_key: &SecretKey, digest: [u8; 32]) -> Vec<u8> {
    let secp = Secp256k1::signing_only();
    let message = Message::from_digest(digest);
    let mut signature = secp.sign_ecdsa(&message, secret_key);
    signature.normalize_s();
    signature.serialize_der().to_vec()
}

/// Verify a DER signature over a 32-byte digest
pub fn verify_digest(public_key: &PublicKey, digest: [u8; 32], der_signature: &[u8]) -> bool {
    let secp = Secp256k1::verification_only();
    let message = Message::from_digest(digest);
    match Signature::from_der(der_signature) {
        Ok(signature) => secp.verify_ecdsa(&message, &signature, public_key).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::sha256;

    fn key_one() -> SecretKey {
        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        SecretKey::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_key_pair_generation() {
        let kp = KeyPair::generate();
        assert_eq!(kp.public_key_hex().len(), 66);
        assert!(kp.address().starts_with('1'));
    }

    #[test]
    fn test_known_wif_and_address() {
        let kp = KeyPair::from_secret_key(key_one());
        assert_eq!(
            kp.to_wif(),
            "KwDiBf89QgGbjEhKnhXJuH7LrciVrZi3qYjgd9M7rFU73sVHnoWn"
        );
        assert_eq!(kp.address(), "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH");
    }

    #[test]
    fn test_wif_round_trip() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::from_wif(&kp1.to_wif()).unwrap();
        assert_eq!(kp1.public_key_hex(), kp2.public_key_hex());
        assert_eq!(kp1.address(), kp2.address());
    }

    #[test]
    fn test_invalid_wif_rejected() {
        assert!(matches!(
            wif_to_secret_key("not-a-wif"),
            Err(KeyError::InvalidWif(_))
        ));
        // A valid address is valid base58check but carries the wrong prefix
        assert!(matches!(
            wif_to_secret_key("1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH"),
            Err(KeyError::InvalidWif(_))
        ));
    }

    #[test]
    fn test_address_round_trip() {
        let kp = KeyPair::generate();
        let pkh = address_to_pubkey_hash(&kp.address()).unwrap();
        assert_eq!(pkh, kp.public_key_hash());
        assert_eq!(pubkey_hash_to_address(&pkh), kp.address());
    }

    #[test]
    fn test_testnet_address_rejected() {
        let result = address_to_pubkey_hash("mipcBbFg9gMiCh81Kj8tqqdgoZub1ZJRfn");
        assert_eq!(result, Err(KeyError::WrongNetwork(0x6f)));
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = KeyPair::generate();
        let digest = sha256(b"Hello, BSV!");
        let signature = kp.sign_digest(digest);
        assert!(verify_digest(&kp.public_key, digest, &signature));

        let other = sha256(b"something else");
        assert!(!verify_digest(&kp.public_key, other, &signature));
    }
}
