use std::sync::Arc;

use karst_types::error::Result;

use crate::compress::{self, Compression};
use crate::crypto::CryptoEngine;

/// Encode/decode pipeline applied to every stored buffer: optional
/// compression, then optional authenticated encryption with a per-buffer
/// nonce prepended by the engine.
#[derive(Clone)]
pub struct BlobCodec {
    compression: Compression,
    crypto: Arc<dyn CryptoEngine>,
}

impl BlobCodec {
    pub fn new(compression: Compression, crypto: Arc<dyn CryptoEngine>) -> Self {
        Self {
            compression,
            crypto,
        }
    }

    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let compressed = compress::compress(self.compression, data)?;
        self.crypto.encrypt(&compressed, &[])
    }

    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.crypto.decrypt(data, &[])?;
        compress::decompress(&compressed)
    }

    pub fn is_encrypting(&self) -> bool {
        self.crypto.is_encrypting()
    }
}
