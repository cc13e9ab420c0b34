use std::fmt;

use blake2::digest::consts::U32;
use blake2::digest::Mac as _;
use blake2::Blake2bMac;
use serde::{Deserialize, Serialize};

use crate::error::{KarstError, Result};

type KeyedBlake2b256 = Blake2bMac<U32>;

/// A 32-byte content identifier computed as keyed BLAKE2b-256 over the
/// canonical serialization of a blob payload.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Mac(pub [u8; 32]);

impl Mac {
    pub const SIZE: usize = 32;

    /// Compute the MAC of `data` under `key`.
    pub fn compute(key: &[u8; 32], data: &[u8]) -> Self {
        let mut hasher = MacHasher::new(key);
        hasher.update(data);
        hasher.finalize()
    }

    /// Lowercase hex form, 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the canonical 64-character lowercase hex form.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(KarstError::InvalidArgument(format!(
                "identifier must be 64 hex characters, got {}",
                s.len()
            )));
        }
        let decoded = hex::decode(s)
            .map_err(|e| KarstError::InvalidArgument(format!("invalid identifier hex: {e}")))?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&decoded);
        Ok(Mac(out))
    }

    /// First byte as a two-char hex string, used for shard directories.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mac({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Streaming MAC computation, for hashing file content chunk by chunk.
pub struct MacHasher {
    inner: KeyedBlake2b256,
}

impl MacHasher {
    pub fn new(key: &[u8; 32]) -> Self {
        let inner =
            KeyedBlake2b256::new_from_slice(key).expect("valid 32-byte key for BLAKE2b-MAC");
        Self { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        blake2::digest::Mac::update(&mut self.inner, data);
    }

    pub fn finalize(self) -> Mac {
        let result = self.inner.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&result.into_bytes());
        Mac(out)
    }
}
