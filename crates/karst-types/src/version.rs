use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KarstError, Result};

/// A structured format version.
///
/// Stored explicitly as three 16-bit components; the fixed-width codec lays
/// them out little-endian in 6 bytes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl Version {
    pub const SERIALIZED_SIZE: usize = 6;

    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn to_bytes(self) -> [u8; Self::SERIALIZED_SIZE] {
        let mut buf = [0u8; Self::SERIALIZED_SIZE];
        buf[0..2].copy_from_slice(&self.major.to_le_bytes());
        buf[2..4].copy_from_slice(&self.minor.to_le_bytes());
        buf[4..6].copy_from_slice(&self.patch.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SERIALIZED_SIZE {
            return Err(KarstError::Malformed(format!(
                "short read while decoding version: {} bytes",
                buf.len()
            )));
        }
        Ok(Self {
            major: u16::from_le_bytes([buf[0], buf[1]]),
            minor: u16::from_le_bytes([buf[2], buf[3]]),
            patch: u16::from_le_bytes([buf[4], buf[5]]),
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_roundtrip() {
        let v = Version::new(1, 12, 345);
        assert_eq!(Version::from_bytes(&v.to_bytes()).unwrap(), v);
    }

    #[test]
    fn short_buffer_rejected() {
        assert!(Version::from_bytes(&[1, 0, 0]).is_err());
    }

    #[test]
    fn ordering_is_component_wise() {
        assert!(Version::new(1, 0, 0) < Version::new(1, 0, 1));
        assert!(Version::new(1, 9, 9) < Version::new(2, 0, 0));
    }

    #[test]
    fn display_form() {
        assert_eq!(Version::new(1, 2, 3).to_string(), "1.2.3");
    }
}
