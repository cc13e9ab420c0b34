use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;

use karst_types::error::{KarstError, Result};

use super::CryptoEngine;

/// ChaCha20-Poly1305 authenticated encryption engine.
pub struct Chacha20Poly1305Engine {
    cipher: ChaCha20Poly1305,
    mac_key: [u8; 32],
}

impl Chacha20Poly1305Engine {
    pub fn new(encryption_key: &[u8; 32], mac_key: &[u8; 32]) -> Self {
        let cipher = ChaCha20Poly1305::new_from_slice(encryption_key)
            .expect("valid 32-byte key for ChaCha20-Poly1305");
        Self {
            cipher,
            mac_key: *mac_key,
        }
    }
}

impl CryptoEngine for Chacha20Poly1305Engine {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| KarstError::Other(format!("ChaCha20-Poly1305 encrypt: {e}")))?;

        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 12 + 16 {
            return Err(KarstError::AuthFailure);
        }
        let (nonce_bytes, ciphertext) = data.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| KarstError::AuthFailure)
    }

    fn is_encrypting(&self) -> bool {
        true
    }

    fn mac_key(&self) -> &[u8; 32] {
        &self.mac_key
    }
}
