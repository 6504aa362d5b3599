//! Where we persist metadata about our files and blocks.
//!
//! The block store only needs an ordered key/value store, so we talk to it through
//! [MetadataStore]. There's a [kv] backed implementation for real usage, and an in-memory one
//! that is handy for tests.
//!
//! Every key starts with a one-byte tag, followed by the consensus encoding of the actual key:
//!
//! | tag | key            | value          |
//! |-----|----------------|----------------|
//! | `f` | file number    | BlockFileInfo  |
//! | `t` | txid           | DiskTxPos      |
//! | `b` | block hash     | DiskBlockIndex |
//! | `F` | flag name      | `'1'` or `'0'` |
//! | `R` |                | `'1'`          |
//! | `l` |                | file number    |
use std::collections::BTreeMap;
use std::convert::Infallible;

use bitcoin::consensus::serialize;
use bitcoin::BlockHash;
use bitcoin::Txid;
use spin::RwLock;

use crate::error::DatabaseError;
use crate::read_lock;
use crate::write_lock;

pub const DB_BLOCK_FILES: u8 = b'f';
pub const DB_TXINDEX: u8 = b't';
pub const DB_BLOCK_INDEX: u8 = b'b';
pub const DB_FLAG: u8 = b'F';
pub const DB_REINDEX_FLAG: u8 = b'R';
pub const DB_LAST_BLOCK: u8 = b'l';

fn tagged(tag: u8, key: &[u8]) -> Vec<u8> {
    let mut tagged = Vec::with_capacity(key.len() + 1);
    tagged.push(tag);
    tagged.extend_from_slice(key);
    tagged
}

pub fn file_info_key(file_index: u32) -> Vec<u8> {
    tagged(DB_BLOCK_FILES, &serialize(&file_index))
}

pub fn tx_index_key(txid: &Txid) -> Vec<u8> {
    tagged(DB_TXINDEX, &serialize(txid))
}

pub fn block_index_key(hash: &BlockHash) -> Vec<u8> {
    tagged(DB_BLOCK_INDEX, &serialize(hash))
}

pub fn flag_key(name: &str) -> Vec<u8> {
    tagged(DB_FLAG, &serialize(&name.as_bytes().to_vec()))
}

pub fn reindex_key() -> Vec<u8> {
    vec![DB_REINDEX_FLAG]
}

pub fn last_block_key() -> Vec<u8> {
    vec![DB_LAST_BLOCK]
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One entry in a batched write
pub enum MetadataWrite {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// An ordered key/value store
///
/// Implementations must be usable from many threads at once, hence the `&self` everywhere.
pub trait MetadataStore {
    type Error: DatabaseError;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Applies all entries at once, or none of them
    fn batch_write(&self, entries: Vec<MetadataWrite>) -> Result<(), Self::Error>;

    fn delete(&self, key: &[u8]) -> Result<(), Self::Error>;

    /// Every entry whose key starts with `prefix`, ordered by key
    fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Self::Error>;

    /// Makes sure everything we've written so far is on disk
    fn flush(&self) -> Result<(), Self::Error>;
}

#[cfg(feature = "kv-store")]
pub use kv_store::KvMetadataStore;

#[cfg(feature = "kv-store")]
mod kv_store {
    use kv::Batch;
    use kv::Bucket;
    use kv::Config;
    use kv::Store;

    use super::MetadataStore;
    use super::MetadataWrite;

    /// Our metadata, inside a [kv] bucket
    pub struct KvMetadataStore<'a> {
        _store: Store,
        meta: Bucket<'a, Vec<u8>, Vec<u8>>,
    }

    impl<'a> KvMetadataStore<'a> {
        /// Opens (or creates) the database at `path`
        pub fn new(path: &str, cache_size: u64) -> Result<KvMetadataStore<'a>, kv::Error> {
            let cfg = Config::new(path).cache_capacity(cache_size);
            let store = Store::new(cfg)?;

            Ok(KvMetadataStore {
                meta: store.bucket(Some("blockstore"))?,
                _store: store,
            })
        }
    }

    impl MetadataStore for KvMetadataStore<'_> {
        type Error = kv::Error;

        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error> {
            self.meta.get(&key.to_vec())
        }

        fn batch_write(&self, entries: Vec<MetadataWrite>) -> Result<(), Self::Error> {
            let mut batch = Batch::new();
            for entry in entries {
                match entry {
                    MetadataWrite::Put(key, value) => batch.set(&key, &value)?,
                    MetadataWrite::Delete(key) => batch.remove(&key)?,
                }
            }

            self.meta.batch(batch)
        }

        fn delete(&self, key: &[u8]) -> Result<(), Self::Error> {
            self.meta.remove(&key.to_vec())?;
            Ok(())
        }

        fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Self::Error> {
            let mut entries = Vec::new();
            for item in self.meta.iter() {
                let item = item?;
                let key = item.key::<Vec<u8>>()?;
                if !key.starts_with(prefix) {
                    continue;
                }

                entries.push((key, item.value::<Vec<u8>>()?));
            }

            Ok(entries)
        }

        fn flush(&self) -> Result<(), Self::Error> {
            self.meta.flush()?;
            Ok(())
        }
    }
}

impl DatabaseError for Infallible {}

#[derive(Debug, Default)]
/// A [MetadataStore] that lives in memory and never fails
pub struct MemoryMetadataStore {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        MemoryMetadataStore::default()
    }
}

impl MetadataStore for MemoryMetadataStore {
    type Error = Infallible;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(read_lock!(self).get(key).cloned())
    }

    fn batch_write(&self, entries: Vec<MetadataWrite>) -> Result<(), Self::Error> {
        let mut inner = write_lock!(self);
        for entry in entries {
            match entry {
                MetadataWrite::Put(key, value) => {
                    inner.insert(key, value);
                }
                MetadataWrite::Delete(key) => {
                    inner.remove(&key);
                }
            }
        }

        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), Self::Error> {
        write_lock!(self).remove(key);
        Ok(())
    }

    fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Self::Error> {
        Ok(read_lock!(self)
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn flush(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}
