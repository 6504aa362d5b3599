//! The block store, gluing our files, the block index and the metadata database together.
//!
//! There's no global instance of this: whoever starts the node builds one [BlockStore] and hands
//! it (usually inside an `Arc`) to everyone who needs blocks. Reads can happen from any thread,
//! and go straight to the mapped files. Writes are serialized by the [AppendWriter].
//!
//! Metadata is only persisted on [BlockStore::flush] (or through
//! [BlockStore::write_batch_sync]), data written to block files but not yet flushed will be
//! found again by a reindex.
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bitcoin::block::Header;
use bitcoin::consensus::deserialize;
use bitcoin::consensus::serialize;
use bitcoin::constants::genesis_block;
use bitcoin::params::Params;
use bitcoin::BlockHash;
use bitcoin::Txid;
use log::debug;
use log::info;
use log::warn;
use spin::RwLock;

use crate::block_index::BlockIndex;
use crate::block_index::BlockStatus;
use crate::block_index::DiskBlockIndex;
use crate::block_index::HeaderChain;
use crate::block_index::NodeId;
use crate::config::BlockStoreConfig;
use crate::disk::BlockFileInfo;
use crate::disk::DiskPosition;
use crate::disk::DiskTxPos;
use crate::disk::StorageKind;
use crate::error::BlockStoreError;
use crate::file_cache::BlockBuffer;
use crate::file_cache::MappedFileCache;
use crate::metadata::block_index_key;
use crate::metadata::file_info_key;
use crate::metadata::flag_key;
use crate::metadata::last_block_key;
use crate::metadata::reindex_key;
use crate::metadata::tx_index_key;
use crate::metadata::MetadataStore;
use crate::metadata::MetadataWrite;
use crate::metadata::DB_BLOCK_FILES;
use crate::metadata::DB_BLOCK_INDEX;
use crate::read_lock;
use crate::record::RawBlock;
use crate::write_lock;
use crate::writer::AppendWriter;

/// Everything behind our index lock
#[derive(Debug, Default)]
pub struct IndexState {
    pub index: BlockIndex,
    pub chain: HeaderChain,

    /// Nodes that changed since our last flush
    dirty: BTreeSet<NodeId>,
}

impl IndexState {
    /// Tells the store this node must be persisted on the next flush
    pub fn mark_dirty(&mut self, id: NodeId) {
        self.dirty.insert(id);
    }
}

pub struct BlockStore<M: MetadataStore> {
    config: BlockStoreConfig,
    files: Arc<MappedFileCache>,
    writer: AppendWriter,
    metadata: M,
    reindexing: AtomicBool,
    inner: RwLock<IndexState>,
}

impl<M: MetadataStore> BlockStore<M> {
    /// Opens the store inside `config.data_dir`
    ///
    /// Extra data dirs without a `blocks` directory are ignored. If `config.wipe` is set, every
    /// piece of metadata is thrown away, the block files themselves are left alone.
    pub fn new(config: BlockStoreConfig, metadata: M) -> Result<Self, BlockStoreError> {
        let blocks_dir = config.blocks_dir();
        std::fs::create_dir_all(&blocks_dir)?;

        let search_dirs = config
            .block_data_dirs
            .iter()
            .filter_map(|dir| {
                let blocks = Path::new(dir).join("blocks");
                if blocks.is_dir() {
                    return Some(blocks);
                }

                warn!("ignoring block data dir {dir}, it has no blocks directory");
                None
            })
            .collect::<Vec<PathBuf>>();

        if config.wipe {
            let entries = metadata
                .iterate(&[])?
                .into_iter()
                .map(|(key, _)| MetadataWrite::Delete(key))
                .collect::<Vec<_>>();

            info!("wiping {} metadata entries", entries.len());
            metadata.batch_write(entries)?;
        }

        let files = Arc::new(MappedFileCache::new(blocks_dir, search_dirs));
        let writer = AppendWriter::new(files.clone(), &config);

        let reindexing = config.reindex || metadata.get(&reindex_key())?.is_some();
        let store = BlockStore {
            config,
            files,
            writer,
            metadata,
            reindexing: AtomicBool::new(false),
            inner: RwLock::new(IndexState::default()),
        };

        if reindexing {
            // we'll find everything again, starting from the first file
            store.set_reindexing(true)?;
        } else {
            let last_file = store.read_last_block_file()?.unwrap_or(0);
            let files = store.read_block_file_infos()?;
            store.writer.restore(last_file, files)?;
        }

        Ok(store)
    }

    pub fn config(&self) -> &BlockStoreConfig {
        &self.config
    }

    pub fn files(&self) -> &MappedFileCache {
        &self.files
    }

    pub fn writer(&self) -> &AppendWriter {
        &self.writer
    }

    /// Runs `f` with our index and header chain, holding a read lock
    pub fn read_index<T>(&self, f: impl FnOnce(&BlockIndex, &HeaderChain) -> T) -> T {
        let inner = read_lock!(self);
        f(&inner.index, &inner.chain)
    }

    /// Runs `f` with our index and header chain, holding a write lock
    ///
    /// Nodes changed here should be marked as dirty, or they won't be persisted.
    pub fn write_index<T>(&self, f: impl FnOnce(&mut IndexState) -> T) -> T {
        let mut inner = write_lock!(self);
        f(&mut inner)
    }

    /// Reads a block at `pos`. The buffer points straight into the file
    pub fn load_block(&self, pos: DiskPosition) -> Result<BlockBuffer, BlockStoreError> {
        self.files.read(pos, StorageKind::BlockData, None)
    }

    /// Reads the undo data at `pos`, checking that it belongs to a block whose parent is
    /// `parent_hash`
    pub fn load_undo_block(
        &self,
        pos: DiskPosition,
        parent_hash: &BlockHash,
    ) -> Result<BlockBuffer, BlockStoreError> {
        self.files.read(pos, StorageKind::UndoData, Some(parent_hash))
    }

    /// A whole block file, or `None` if we don't have it
    pub fn load_block_file(&self, file_index: u32) -> Result<Option<BlockBuffer>, BlockStoreError> {
        self.files.load_file(StorageKind::BlockData, file_index)
    }

    /// Appends a full block to our current block file
    ///
    /// # Panics
    ///
    /// If `block` isn't exactly one serialized block.
    pub fn write_block(
        &self,
        height: u32,
        block: &[u8],
    ) -> Result<(BlockBuffer, DiskPosition), BlockStoreError> {
        let is_full_block = RawBlock::new(block)
            .map(|block| block.is_full_block())
            .unwrap_or(false);
        assert!(is_full_block, "only full blocks can be written");

        self.writer
            .write(StorageKind::BlockData, Some(height), block, None, None)
    }

    /// Appends undo data to the undo file paired with `file_index`
    ///
    /// `parent_hash` is the hash of the parent of the block being undone, we'll need it to read
    /// this record back.
    pub fn write_undo_block(
        &self,
        undo: &[u8],
        parent_hash: &BlockHash,
        file_index: u32,
    ) -> Result<(BlockBuffer, DiskPosition), BlockStoreError> {
        assert!(!undo.is_empty(), "empty undo block");

        self.writer.write(
            StorageKind::UndoData,
            None,
            undo,
            Some(file_index),
            Some(parent_hash),
        )
    }

    /// Adds a header to the index and feeds it to the header chain
    ///
    /// Returns the node and whether our main chain tip changed.
    pub fn accept_header(&self, header: &Header) -> Result<(NodeId, bool), BlockStoreError> {
        let mut inner = write_lock!(self);
        let id = inner.index.insert_header(header)?;
        inner.dirty.insert(id);

        let IndexState { index, chain, .. } = &mut *inner;
        let changed = chain.append_header(index, id);

        Ok((id, changed))
    }

    /// Feeds a node that's already in the index to the header chain
    ///
    /// Call this after a node changes its validity, so the header chain can react to it.
    pub fn append_header(&self, id: NodeId) -> bool {
        let mut inner = write_lock!(self);
        let IndexState { index, chain, .. } = &mut *inner;
        let changed = chain.append_header(index, id);

        if changed {
            if let Some(tip) = chain.tip() {
                debug!(
                    "best header is now {} at height {}",
                    index[tip].hash, index[tip].height
                );
            }
        }

        changed
    }

    /// Our best header, and its height
    pub fn header_chain_tip(&self) -> Option<(BlockHash, u32)> {
        self.read_index(|index, chain| {
            chain
                .tip()
                .map(|tip| (index[tip].hash, index[tip].height))
        })
    }

    /// The tip of each fork we know of
    pub fn header_chain_tips(&self) -> Vec<BlockHash> {
        self.read_index(|index, chain| chain.tips().iter().map(|tip| index[*tip].hash).collect())
    }

    /// The main chain block at `height`
    pub fn block_hash_at(&self, height: u32) -> Option<BlockHash> {
        self.read_index(|index, chain| chain.get(height).map(|id| index[id].hash))
    }

    /// Where we've stored the block with this hash
    pub fn block_position(&self, hash: &BlockHash) -> Option<DiskPosition> {
        self.read_index(|index, _| index.find(hash).and_then(|id| index[id].data_pos))
    }

    /// Persists a single node, without going through the header chain
    pub fn append_block(&self, id: NodeId, last_file: u32) -> Result<(), BlockStoreError> {
        self.write_batch_sync(&[], last_file, &[id])
    }

    /// Writes file infos, our last file and block index nodes in one batch, then flushes the
    /// database
    pub fn write_batch_sync(
        &self,
        files: &[(u32, BlockFileInfo)],
        last_file: u32,
        blocks: &[NodeId],
    ) -> Result<(), BlockStoreError> {
        let mut batch = Vec::with_capacity(files.len() + blocks.len() + 1);
        for (file_index, info) in files {
            batch.push(MetadataWrite::Put(file_info_key(*file_index), serialize(info)));
        }

        batch.push(MetadataWrite::Put(last_block_key(), serialize(&last_file)));

        {
            let inner = read_lock!(self);
            for id in blocks {
                let Some(record) = inner.index.to_disk(*id) else {
                    continue;
                };

                let key = block_index_key(&record.header.block_hash());
                batch.push(MetadataWrite::Put(key, serialize(&record)));
            }
        }

        self.metadata.batch_write(batch)?;
        self.metadata.flush()?;

        Ok(())
    }

    pub fn read_block_file_info(
        &self,
        file_index: u32,
    ) -> Result<Option<BlockFileInfo>, BlockStoreError> {
        match self.metadata.get(&file_info_key(file_index))? {
            Some(info) => Ok(Some(deserialize(&info)?)),
            None => Ok(None),
        }
    }

    /// Every file info we have, indexed by file number
    fn read_block_file_infos(&self) -> Result<Vec<BlockFileInfo>, BlockStoreError> {
        let mut files = Vec::new();
        for (key, value) in self.metadata.iterate(&[DB_BLOCK_FILES])? {
            let file_index: u32 = deserialize(&key[1..])?;
            let idx = file_index as usize;
            if files.len() <= idx {
                files.resize(idx + 1, BlockFileInfo::default());
            }

            files[idx] = deserialize(&value)?;
        }

        Ok(files)
    }

    pub fn read_last_block_file(&self) -> Result<Option<u32>, BlockStoreError> {
        match self.metadata.get(&last_block_key())? {
            Some(last) => Ok(Some(deserialize(&last)?)),
            None => Ok(None),
        }
    }

    pub fn write_flag(&self, name: &str, value: bool) -> Result<(), BlockStoreError> {
        let value = if value { b'1' } else { b'0' };
        self.metadata
            .batch_write(vec![MetadataWrite::Put(flag_key(name), vec![value])])?;

        Ok(())
    }

    /// Reads a named flag, `None` if it was never written
    pub fn read_flag(&self, name: &str) -> Result<Option<bool>, BlockStoreError> {
        Ok(self
            .metadata
            .get(&flag_key(name))?
            .map(|value| value == [b'1']))
    }

    pub fn is_reindexing(&self) -> bool {
        self.reindexing.load(Ordering::SeqCst)
    }

    /// Sets (or clears) the reindex flag, persisting it right away
    ///
    /// If we crash in the middle of a reindex, we'll start over next time.
    pub fn set_reindexing(&self, reindexing: bool) -> Result<(), BlockStoreError> {
        if self.reindexing.swap(reindexing, Ordering::SeqCst) == reindexing {
            return Ok(());
        }

        match reindexing {
            true => self
                .metadata
                .batch_write(vec![MetadataWrite::Put(reindex_key(), vec![b'1'])])?,
            false => self.metadata.delete(&reindex_key())?,
        }
        self.metadata.flush()?;

        Ok(())
    }

    pub fn write_tx_index(&self, entries: &[(Txid, DiskTxPos)]) -> Result<(), BlockStoreError> {
        let batch = entries
            .iter()
            .map(|(txid, pos)| MetadataWrite::Put(tx_index_key(txid), serialize(pos)))
            .collect();

        self.metadata.batch_write(batch)?;
        Ok(())
    }

    pub fn read_tx_index(&self, txid: &Txid) -> Result<Option<DiskTxPos>, BlockStoreError> {
        match self.metadata.get(&tx_index_key(txid))? {
            Some(pos) => Ok(Some(deserialize(&pos)?)),
            None => Ok(None),
        }
    }

    /// Loads every block index node from the database, then rebuilds the header chain
    ///
    /// Also brings the writer back to where it was, so new blocks go after the last one we know.
    pub fn cache_all_block_infos(&self) -> Result<(), BlockStoreError> {
        let mut records = Vec::new();
        for (_, value) in self.metadata.iterate(&[DB_BLOCK_INDEX])? {
            records.push(deserialize::<DiskBlockIndex>(&value)?);
        }

        // parents must be in the index before their children
        records.sort_by_key(|record| record.height);

        let mut max_file = self.read_last_block_file()?.unwrap_or(0);
        {
            let mut inner = write_lock!(self);
            for record in records.iter() {
                if let Some(pos) = record.data_pos {
                    max_file = max_file.max(pos.file_index);
                }

                if let Err(e) = inner.index.insert_from_disk(record) {
                    warn!("skipping block {}: {e}", record.header.block_hash());
                }
            }
        }

        let mut files = self.read_block_file_infos()?;
        if files.len() <= max_file as usize {
            files.resize(max_file as usize + 1, BlockFileInfo::default());
        }
        self.writer.restore(max_file, files)?;

        info!("loaded {} block index entries", records.len());
        self.rebuild_header_chain();

        Ok(())
    }

    /// Recomputes our tips and main chain from whatever is in the index
    pub fn rebuild_header_chain(&self) -> Option<(BlockHash, u32)> {
        {
            let mut inner = write_lock!(self);
            let IndexState { index, chain, .. } = &mut *inner;

            let mut nodes = index
                .iter()
                .filter(|(_, node)| node.is_known())
                .map(|(id, node)| (node.height, id))
                .collect::<Vec<_>>();
            nodes.sort();

            *chain = HeaderChain::new();
            for (_, id) in nodes {
                chain.append_header(index, id);
            }
        }

        self.header_chain_tip()
    }

    /// Makes sure we have the genesis block for our network, writing it if we don't
    ///
    /// Returns whether we had to write it.
    pub fn init_genesis(&self) -> Result<bool, BlockStoreError> {
        let genesis = genesis_block(Params::new(self.config.network));
        let hash = genesis.block_hash();

        let have_data = self.read_index(|index, _| {
            index
                .find(&hash)
                .map(|id| index[id].status.contains(BlockStatus::HAVE_DATA))
                .unwrap_or(false)
        });
        if have_data {
            return Ok(false);
        }

        let (_, pos) = self.write_block(0, &serialize(&genesis))?;
        let (id, _) = self.accept_header(&genesis.header)?;
        self.write_index(|inner| {
            let node = inner.index.get_mut(id)?;
            node.data_pos = Some(pos);
            node.tx_count = genesis.txdata.len() as u32;
            node.status.insert(BlockStatus::HAVE_DATA);
            inner.dirty.insert(id);
            Some(())
        });

        info!("wrote genesis block {hash}");
        self.flush()?;

        Ok(true)
    }

    /// Flushes our files and persists every piece of metadata that changed
    pub fn flush(&self) -> Result<(), BlockStoreError> {
        let (files, last_file) = self.writer.flush()?;
        let dirty = std::mem::take(&mut write_lock!(self).dirty);
        let dirty = dirty.into_iter().collect::<Vec<_>>();

        debug!(
            "flushing {} file infos and {} block index entries",
            files.len(),
            dirty.len()
        );
        self.write_batch_sync(&files, last_file, &dirty)
    }
}

#[cfg(feature = "kv-store")]
impl BlockStore<crate::metadata::KvMetadataStore<'static>> {
    /// Opens a store backed by a [kv](crate::KvMetadataStore) database, at
    /// `{data_dir}/blocks/index`
    pub fn open_kv(config: BlockStoreConfig) -> Result<Self, BlockStoreError> {
        let index_dir = config.index_dir();
        let index_dir = index_dir.to_str().ok_or(BlockStoreError::Malformed("data dir"))?;

        let metadata = crate::metadata::KvMetadataStore::new(index_dir, config.cache_size_bytes())?;
        BlockStore::new(config, metadata)
    }
}
