use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use uuid::Uuid;

use karst_types::error::{KarstError, Result};

/// A signing identity attached to a repository session. Snapshots committed
/// with an identity carry a signature blob over the header MAC.
pub struct Identity {
    pub identifier: Uuid,
    signing_key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            identifier: Uuid::new_v4(),
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret(identifier: Uuid, secret: &[u8; 32]) -> Self {
        Self {
            identifier,
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

/// Verify `signature` over `message` under a stored public key.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<bool> {
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| KarstError::Malformed(format!("public key length {}", public_key.len())))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| KarstError::Malformed(format!("public key: {e}")))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| KarstError::Malformed(format!("signature: {e}")))?;
    Ok(verifying_key.verify(message, &signature).is_ok())
}
