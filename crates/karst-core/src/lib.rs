pub mod btree;
pub mod caching;
pub mod chunker;
pub mod classifier;
pub mod codec;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod events;
pub mod importer;
pub mod objects;
pub mod packfile;
pub mod repository;
pub mod snapshot;
pub mod state;
pub mod storage;
pub mod vfs;

pub use karst_types::error::{KarstError, Result};
pub use karst_types::kind::BlobKind;
pub use karst_types::location::{DeltaEntry, Location};
pub use karst_types::mac::{Mac, MacHasher};
pub use karst_types::version::Version;

#[cfg(test)]
mod tests;
#[cfg(test)]
pub(crate) mod testutil;
