//! Block storage for Floresta.
//!
//! This crate keeps the raw bytes of every block (and the undo data needed to disconnect it) in
//! numbered, append-only files under `{datadir}/blocks/`, named `blk00000.dat`, `rev00000.dat`
//! and so on. Files are memory mapped on demand, so reading a block never copies it: you get a
//! [BlockBuffer] pointing straight into the mapping.
//!
//! On top of the files we keep a [BlockIndex], holding one node for every header we've ever
//! heard of, and a [HeaderChain] that tracks every fork tip and picks the one with the most
//! cumulative work as our main chain.
//!
//! The main entry point is [BlockStore], which glues everything together and persists metadata
//! into some [MetadataStore]. Block files written by other nodes (or by us, if we need to
//! reindex) can be fed back through the [importer](import).

pub mod block_index;
pub mod block_store;
pub mod config;
pub mod disk;
pub mod error;
pub mod file_cache;
pub mod import;
pub mod metadata;
pub mod record;
pub mod writer;

pub use block_index::BlockIndex;
pub use block_index::BlockIndexNode;
pub use block_index::BlockStatus;
pub use block_index::HeaderChain;
pub use block_index::NodeId;
pub use block_store::BlockStore;
pub use config::BlockStoreConfig;
pub use config::ConfigFile;
pub use disk::BlockFileInfo;
pub use disk::DiskPosition;
pub use disk::DiskTxPos;
pub use disk::StorageKind;
pub use error::BlockStoreError;
pub use error::DatabaseError;
pub use file_cache::BlockBuffer;
pub use file_cache::MappedFileCache;
pub use import::Accepted;
pub use import::BlockAcceptor;
pub use import::ImportStats;
pub use import::Importer;
pub use import::spawn_block_importer;
pub use import::IndexingAcceptor;
#[cfg(feature = "kv-store")]
pub use metadata::KvMetadataStore;
pub use metadata::MemoryMetadataStore;
pub use metadata::MetadataStore;
pub use record::RawBlock;
pub use writer::AppendWriter;

#[macro_export]
/// Implements `From<$from_thing>` for `$thing`, wrapping the value in the `$field` variant
macro_rules! impl_error_from {
    ($thing: ty, $from_thing: ty, $field: ident) => {
        impl From<$from_thing> for $thing {
            fn from(e: $from_thing) -> Self {
                <$thing>::$field(e)
            }
        }
    };
}

#[macro_export]
/// Grabs a RwLock for reading
macro_rules! read_lock {
    ($obj:ident) => {
        $obj.inner.read()
    };
}

#[macro_export]
/// Grabs a RwLock for writing
macro_rules! write_lock {
    ($obj:ident) => {
        $obj.inner.write()
    };
}
