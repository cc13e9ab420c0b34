pub mod aes_gcm;
pub mod chacha20_poly1305;
pub mod key;

use serde::{Deserialize, Serialize};

use karst_types::error::Result;

/// Trait for encrypting and decrypting repository buffers.
pub trait CryptoEngine: Send + Sync {
    /// Encrypt plaintext. Returns `[nonce][ciphertext+tag]`.
    /// `aad` is authenticated but not encrypted.
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt data produced by `encrypt`.
    /// `aad` must match what was passed during encryption.
    fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Whether this engine actually encrypts data.
    fn is_encrypting(&self) -> bool;

    /// The key used for computing blob MACs (keyed BLAKE2b-256).
    fn mac_key(&self) -> &[u8; 32];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    #[serde(rename = "AES256-GCM")]
    Aes256Gcm,
    #[serde(rename = "CHACHA20-POLY1305")]
    Chacha20Poly1305,
}

impl EncryptionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionAlgorithm::Aes256Gcm => "AES256-GCM",
            EncryptionAlgorithm::Chacha20Poly1305 => "CHACHA20-POLY1305",
        }
    }
}

/// No-encryption engine. Still carries the MAC key so blob identifiers stay
/// deterministic per repository.
pub struct PlaintextEngine {
    mac_key: [u8; 32],
}

impl PlaintextEngine {
    pub fn new(mac_key: &[u8; 32]) -> Self {
        Self { mac_key: *mac_key }
    }
}

impl CryptoEngine for PlaintextEngine {
    fn encrypt(&self, plaintext: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, data: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn is_encrypting(&self) -> bool {
        false
    }

    fn mac_key(&self) -> &[u8; 32] {
        &self.mac_key
    }
}
