use std::sync::Arc;

use argon2::Argon2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use karst_types::error::{KarstError, Result};

use super::aes_gcm::Aes256GcmEngine;
use super::chacha20_poly1305::Chacha20Poly1305Engine;
use super::{CryptoEngine, EncryptionAlgorithm};

/// Known plaintext encrypted at repository creation. Decrypting it verifies
/// the passphrase before any real data is touched.
const CANARY_PLAINTEXT: &[u8] = b"karst-canary-v1";
const CANARY_AAD: &[u8] = b"canary";

/// KDF parameters stored in the repository configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

impl KdfParams {
    pub fn generate() -> Self {
        let mut salt = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self {
            algorithm: "argon2id".to_string(),
            time_cost: 3,
            memory_cost: 65536, // 64 MiB
            parallelism: 4,
            salt,
        }
    }
}

/// Encryption parameters stored in the repository configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionParams {
    pub algorithm: EncryptionAlgorithm,
    pub kdf: KdfParams,
    /// Ciphertext of a known constant, used to validate the passphrase.
    pub canary: Vec<u8>,
}

// KDF parameter bounds to reject maliciously crafted configurations.
const MAX_TIME_COST: u32 = 10;
const MAX_PARALLELISM: u32 = 16;
const MAX_MEMORY_KIB: u32 = 524_288; // 512 MiB
const MIN_SALT_LEN: usize = 16;
const MAX_SALT_LEN: usize = 64;

fn validate_kdf_params(kdf: &KdfParams) -> Result<()> {
    if kdf.algorithm != "argon2id" {
        return Err(KarstError::AuthFailure);
    }
    if kdf.time_cost == 0 || kdf.time_cost > MAX_TIME_COST {
        return Err(KarstError::AuthFailure);
    }
    if kdf.parallelism == 0 || kdf.parallelism > MAX_PARALLELISM {
        return Err(KarstError::AuthFailure);
    }
    if kdf.memory_cost == 0 || kdf.memory_cost > MAX_MEMORY_KIB {
        return Err(KarstError::AuthFailure);
    }
    if kdf.salt.len() < MIN_SALT_LEN || kdf.salt.len() > MAX_SALT_LEN {
        return Err(KarstError::AuthFailure);
    }
    Ok(())
}

/// Derived key material: 32 bytes for the cipher, 32 bytes for blob MACs.
pub struct DerivedKeys {
    pub encryption_key: Zeroizing<[u8; 32]>,
    pub mac_key: Zeroizing<[u8; 32]>,
}

/// Derive the repository key material from a passphrase using Argon2id.
pub fn derive_keys(passphrase: &str, kdf: &KdfParams) -> Result<DerivedKeys> {
    validate_kdf_params(kdf)?;

    let params = argon2::Params::new(kdf.memory_cost, kdf.time_cost, kdf.parallelism, Some(64))
        .map_err(|e| KarstError::Config(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; 64]);
    argon2
        .hash_password_into(passphrase.as_bytes(), &kdf.salt, output.as_mut())
        .map_err(|e| KarstError::Config(format!("argon2 hash: {e}")))?;

    let mut encryption_key = Zeroizing::new([0u8; 32]);
    let mut mac_key = Zeroizing::new([0u8; 32]);
    encryption_key.copy_from_slice(&output[..32]);
    mac_key.copy_from_slice(&output[32..]);
    Ok(DerivedKeys {
        encryption_key,
        mac_key,
    })
}

fn build_engine(
    algorithm: EncryptionAlgorithm,
    keys: &DerivedKeys,
) -> Arc<dyn CryptoEngine> {
    match algorithm {
        EncryptionAlgorithm::Aes256Gcm => {
            Arc::new(Aes256GcmEngine::new(&keys.encryption_key, &keys.mac_key))
        }
        EncryptionAlgorithm::Chacha20Poly1305 => Arc::new(Chacha20Poly1305Engine::new(
            &keys.encryption_key,
            &keys.mac_key,
        )),
    }
}

/// Build encryption parameters (including the canary) for a new repository.
pub fn init_encryption(
    algorithm: EncryptionAlgorithm,
    passphrase: &str,
) -> Result<(EncryptionParams, Arc<dyn CryptoEngine>)> {
    let kdf = KdfParams::generate();
    let keys = derive_keys(passphrase, &kdf)?;
    let engine = build_engine(algorithm, &keys);
    let canary = engine.encrypt(CANARY_PLAINTEXT, CANARY_AAD)?;
    Ok((
        EncryptionParams {
            algorithm,
            kdf,
            canary,
        },
        engine,
    ))
}

/// Rebuild the crypto engine for an existing repository, verifying the
/// passphrase against the stored canary.
pub fn open_encryption(
    params: &EncryptionParams,
    passphrase: &str,
) -> Result<Arc<dyn CryptoEngine>> {
    let keys = derive_keys(passphrase, &params.kdf)?;
    let engine = build_engine(params.algorithm, &keys);
    let plaintext = engine.decrypt(&params.canary, CANARY_AAD)?;
    if plaintext != CANARY_PLAINTEXT {
        return Err(KarstError::AuthFailure);
    }
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_kdf() -> KdfParams {
        let mut salt = vec![0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        KdfParams {
            algorithm: "argon2id".to_string(),
            time_cost: 1,
            memory_cost: 8192,
            parallelism: 1,
            salt,
        }
    }

    fn fast_init(
        algorithm: EncryptionAlgorithm,
        passphrase: &str,
    ) -> (EncryptionParams, Arc<dyn CryptoEngine>) {
        let kdf = fast_kdf();
        let keys = derive_keys(passphrase, &kdf).unwrap();
        let engine = build_engine(algorithm, &keys);
        let canary = engine.encrypt(CANARY_PLAINTEXT, CANARY_AAD).unwrap();
        (
            EncryptionParams {
                algorithm,
                kdf,
                canary,
            },
            engine,
        )
    }

    #[test]
    fn derive_is_deterministic() {
        let kdf = fast_kdf();
        let a = derive_keys("pw", &kdf).unwrap();
        let b = derive_keys("pw", &kdf).unwrap();
        assert_eq!(*a.encryption_key, *b.encryption_key);
        assert_eq!(*a.mac_key, *b.mac_key);
    }

    #[test]
    fn canary_accepts_correct_passphrase() {
        for algorithm in [
            EncryptionAlgorithm::Aes256Gcm,
            EncryptionAlgorithm::Chacha20Poly1305,
        ] {
            let (params, _) = fast_init(algorithm, "correct horse");
            assert!(open_encryption(&params, "correct horse").is_ok());
        }
    }

    #[test]
    fn canary_rejects_wrong_passphrase() {
        let (params, _) = fast_init(EncryptionAlgorithm::Aes256Gcm, "right");
        assert!(matches!(
            open_encryption(&params, "wrong"),
            Err(KarstError::AuthFailure)
        ));
    }

    #[test]
    fn engine_roundtrip_with_aad() {
        let (_, engine) = fast_init(EncryptionAlgorithm::Chacha20Poly1305, "pw");
        let ciphertext = engine.encrypt(b"payload", b"context").unwrap();
        assert_eq!(engine.decrypt(&ciphertext, b"context").unwrap(), b"payload");
        assert!(engine.decrypt(&ciphertext, b"other").is_err());
    }

    #[test]
    fn kdf_bounds_rejected() {
        let mut kdf = fast_kdf();
        kdf.memory_cost = MAX_MEMORY_KIB + 1;
        assert!(matches!(
            derive_keys("pw", &kdf),
            Err(KarstError::AuthFailure)
        ));

        let mut kdf = fast_kdf();
        kdf.algorithm = "scrypt".to_string();
        assert!(derive_keys("pw", &kdf).is_err());

        let mut kdf = fast_kdf();
        kdf.salt = vec![0u8; 4];
        assert!(derive_keys("pw", &kdf).is_err());
    }
}
