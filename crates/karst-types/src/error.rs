use thiserror::Error;

pub type Result<T> = std::result::Result<T, KarstError>;

#[derive(Debug, Error)]
pub enum KarstError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("integrity mismatch: {0}")]
    IntegrityMismatch(String),

    #[error("malformed data: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("authentication failed: wrong passphrase or corrupted key material")]
    AuthFailure,

    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("repository is locked by another process (lock: {0})")]
    Locked(String),

    #[error("unknown blob kind tag: {0}")]
    UnknownBlobKind(u8),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("unknown state entry tag: {0}")]
    UnknownStateEntryTag(u8),

    #[error("unsupported storage version: {0}")]
    UnsupportedVersion(String),

    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("backup aborted: {0}")]
    Aborted(String),

    #[error("{0}")]
    Other(String),
}

impl KarstError {
    /// Whether the error indicates missing data, as opposed to corrupt or
    /// unreachable data.
    pub fn is_not_found(&self) -> bool {
        matches!(self, KarstError::NotFound(_))
    }
}
