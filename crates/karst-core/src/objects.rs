use serde::{Deserialize, Serialize};

use karst_types::error::Result;
use karst_types::mac::Mac;
use karst_types::version::Version;

pub const OBJECT_VERSION: Version = Version::new(1, 0, 0);
pub const CHUNK_VERSION: Version = Version::new(1, 0, 0);

/// A content-defined byte range of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub version: Version,
    pub content_mac: Mac,
    pub length: u32,
    /// Shannon entropy of the chunk bytes in bits per byte, for reporting.
    pub entropy: f64,
    pub flags: u64,
}

impl Chunk {
    pub fn new(content_mac: Mac, length: u32, entropy: f64) -> Self {
        Self {
            version: CHUNK_VERSION,
            content_mac,
            length,
            entropy,
            flags: 0,
        }
    }
}

/// The ordered list of chunks comprising one regular file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub version: Version,
    pub content_mac: Mac,
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub entropy: f64,
    pub flags: u64,
}

impl Object {
    pub fn new() -> Self {
        Self {
            version: OBJECT_VERSION,
            content_mac: Mac::default(),
            chunks: Vec::new(),
            content_type: String::new(),
            entropy: 0.0,
            flags: 0,
        }
    }

    pub fn from_bytes(serialized: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(serialized)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Total file size, reconstructed from chunk lengths.
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|c| u64::from(c.length)).sum()
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

/// Content type by well-known path extension, when one applies.
pub fn content_type_by_extension(pathname: &str) -> Option<&'static str> {
    let extension = pathname.rsplit('.').next()?;
    let mime = match extension.to_ascii_lowercase().as_str() {
        "txt" | "text" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => return None,
    };
    Some(mime)
}

/// Sniff a content type from the leading bytes of a file's first chunk.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    const MAGICS: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF8", "image/gif"),
        (b"%PDF-", "application/pdf"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b", "application/gzip"),
        (b"\x7fELF", "application/x-executable"),
    ];
    for (magic, mime) in MAGICS {
        if data.starts_with(magic) {
            return mime;
        }
    }
    if data.is_empty() || std::str::from_utf8(data).is_ok() {
        "text/plain"
    } else {
        "application/octet-stream"
    }
}

/// Shannon entropy of `data` in bits per byte. Empty data scores 0.
pub fn entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut freq = [0u64; 256];
    for &b in data {
        freq[b as usize] += 1;
    }
    let len = data.len() as f64;
    let mut score = 0.0;
    for &count in freq.iter() {
        if count > 0 {
            let p = count as f64 / len;
            score -= p * p.log2();
        }
    }
    score
}
