use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KarstError, Result};

/// The closed set of blob kinds a repository stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlobKind {
    Snapshot = 1,
    Chunk = 2,
    Object = 3,
    VfsEntry = 4,
    VfsNode = 5,
    VfsBtree = 6,
    XattrEntry = 7,
    XattrNode = 8,
    XattrBtree = 9,
    ErrorEntry = 10,
    ErrorNode = 11,
    ErrorBtree = 12,
    BtreeRoot = 13,
    BtreeNode = 14,
    Signature = 15,
    State = 16,
}

impl BlobKind {
    pub const ALL: [BlobKind; 16] = [
        BlobKind::Snapshot,
        BlobKind::Chunk,
        BlobKind::Object,
        BlobKind::VfsEntry,
        BlobKind::VfsNode,
        BlobKind::VfsBtree,
        BlobKind::XattrEntry,
        BlobKind::XattrNode,
        BlobKind::XattrBtree,
        BlobKind::ErrorEntry,
        BlobKind::ErrorNode,
        BlobKind::ErrorBtree,
        BlobKind::BtreeRoot,
        BlobKind::BtreeNode,
        BlobKind::Signature,
        BlobKind::State,
    ];

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(BlobKind::Snapshot),
            2 => Ok(BlobKind::Chunk),
            3 => Ok(BlobKind::Object),
            4 => Ok(BlobKind::VfsEntry),
            5 => Ok(BlobKind::VfsNode),
            6 => Ok(BlobKind::VfsBtree),
            7 => Ok(BlobKind::XattrEntry),
            8 => Ok(BlobKind::XattrNode),
            9 => Ok(BlobKind::XattrBtree),
            10 => Ok(BlobKind::ErrorEntry),
            11 => Ok(BlobKind::ErrorNode),
            12 => Ok(BlobKind::ErrorBtree),
            13 => Ok(BlobKind::BtreeRoot),
            14 => Ok(BlobKind::BtreeNode),
            15 => Ok(BlobKind::Signature),
            16 => Ok(BlobKind::State),
            other => Err(KarstError::UnknownBlobKind(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlobKind::Snapshot => "snapshot",
            BlobKind::Chunk => "chunk",
            BlobKind::Object => "object",
            BlobKind::VfsEntry => "vfs entry",
            BlobKind::VfsNode => "vfs node",
            BlobKind::VfsBtree => "vfs btree",
            BlobKind::XattrEntry => "xattr entry",
            BlobKind::XattrNode => "xattr node",
            BlobKind::XattrBtree => "xattr btree",
            BlobKind::ErrorEntry => "error entry",
            BlobKind::ErrorNode => "error node",
            BlobKind::ErrorBtree => "error btree",
            BlobKind::BtreeRoot => "btree root",
            BlobKind::BtreeNode => "btree node",
            BlobKind::Signature => "signature",
            BlobKind::State => "state",
        }
    }
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip_all_kinds() {
        for kind in BlobKind::ALL {
            assert_eq!(BlobKind::from_u8(kind.as_u8()).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(matches!(
            BlobKind::from_u8(0),
            Err(KarstError::UnknownBlobKind(0))
        ));
        assert!(matches!(
            BlobKind::from_u8(200),
            Err(KarstError::UnknownBlobKind(200))
        ));
    }
}
