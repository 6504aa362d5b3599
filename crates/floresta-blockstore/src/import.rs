//! Importing blocks from raw block files.
//!
//! This is how we reindex (reading our own `blk?????.dat` files from the start), and how we load
//! a `bootstrap.dat` or any file given with `-loadblock`. Those files are just framed blocks one
//! after the other, but nothing guarantees parents come before their children, so blocks whose
//! parent we don't know yet are put aside and imported as soon as the parent shows up. Children
//! found in our own files wait for the whole run, since while reindexing a parent is often in a
//! later file than its child. Children found in other files are forgotten when that file ends.
//!
//! Anything wrong inside a source (a truncated record, a block that doesn't parse, or the
//! acceptor giving up) stops that source. Whatever we've imported so far stays imported.
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use bitcoin::constants::genesis_block;
use bitcoin::params::Params;
use bitcoin::BlockHash;
use log::debug;
use log::error;
use log::info;
use log::warn;
use spin::RwLock;

use crate::block_index::BlockStatus;
use crate::block_store::BlockStore;
use crate::disk::DiskPosition;
use crate::error::BlockStoreError;
use crate::file_cache::MappedFileCache;
use crate::metadata::MetadataStore;
use crate::record::find_next_frame;
use crate::record::network_magic;
use crate::record::read_frame;
use crate::record::RawBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What an acceptor did with a block
pub enum Accepted {
    /// The block is in our index now, with its data
    Stored(BlockHash),

    /// We already had it
    Duplicate,

    /// The block is invalid. It's been marked as such, but the source may go on
    Rejected(BlockHash),
}

/// Whoever decides what to do with imported blocks
///
/// This is where validation happens. It may be called again while a previous block is still
/// being imported, for the children that were waiting on it.
pub trait BlockAcceptor {
    /// Takes a full block. `pos` is where it lives in our own files, if it does
    ///
    /// Returning an error stops the current source.
    fn accept_block(
        &self,
        block: RawBlock<'_>,
        pos: Option<DiskPosition>,
    ) -> Result<Accepted, BlockStoreError>;
}

/// An acceptor that only checks headers connect, and stores blocks
///
/// Blocks that aren't in our files yet are appended to them. Useful for tests, and for filling
/// the block store before some validator looks at it.
pub struct IndexingAcceptor<M: MetadataStore> {
    store: Arc<BlockStore<M>>,
}

impl<M: MetadataStore> IndexingAcceptor<M> {
    pub fn new(store: Arc<BlockStore<M>>) -> Self {
        IndexingAcceptor { store }
    }
}

impl<M: MetadataStore> BlockAcceptor for IndexingAcceptor<M> {
    fn accept_block(
        &self,
        block: RawBlock<'_>,
        pos: Option<DiskPosition>,
    ) -> Result<Accepted, BlockStoreError> {
        let header = block.header()?;
        let hash = block.block_hash();

        let id = self.store.write_index(|inner| inner.index.insert_header(&header))?;
        let (height, have_data) = self.store.read_index(|index, _| {
            (
                index[id].height,
                index[id].status.contains(BlockStatus::HAVE_DATA),
            )
        });
        if have_data {
            return Ok(Accepted::Duplicate);
        }

        let pos = match pos {
            Some(pos) => {
                let size = block.as_bytes().len() as u32;
                self.store
                    .writer()
                    .note_existing(pos, size, height, block.time())?;
                pos
            }
            None => self.store.write_block(height, block.as_bytes())?.1,
        };

        let tx_count = block.tx_offsets()?.len() as u32;
        self.store.write_index(|inner| {
            if let Some(node) = inner.index.get_mut(id) {
                node.data_pos = Some(pos);
                node.tx_count = tx_count;
                node.status.insert(BlockStatus::HAVE_DATA);
            }
            inner.mark_dirty(id);
        });
        self.store.append_header(id);

        Ok(Accepted::Stored(hash))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
/// How an import went
pub struct ImportStats {
    /// How many sources we've looked at
    pub sources: usize,

    /// Blocks the acceptor stored
    pub loaded: usize,

    /// Blocks we already had
    pub duplicates: usize,

    /// Blocks the acceptor found invalid
    pub rejected: usize,

    /// Blocks whose parent never showed up
    pub orphaned: usize,

    /// Sources we couldn't read to the end
    pub stopped: usize,
}

impl ImportStats {
    pub fn merge(&mut self, other: ImportStats) {
        self.sources += other.sources;
        self.loaded += other.loaded;
        self.duplicates += other.duplicates;
        self.rejected += other.rejected;
        self.orphaned += other.orphaned;
        self.stopped += other.stopped;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where a block waiting on its parent is
enum PendingRecord {
    /// In one of our block files
    Stored(DiskPosition),

    /// At this frame offset, inside the source being imported
    External(usize),
}

/// Reads block files and feeds them to an acceptor
pub struct Importer<'a, M: MetadataStore, A: BlockAcceptor + ?Sized> {
    store: &'a BlockStore<M>,
    acceptor: &'a A,
    magic: [u8; 4],
    genesis: BlockHash,
    shutdown: Arc<RwLock<bool>>,
    /// parent hash -> every record waiting on it
    pending: RefCell<HashMap<BlockHash, Vec<PendingRecord>>>,
}

impl<'a, M: MetadataStore, A: BlockAcceptor + ?Sized> Importer<'a, M, A> {
    pub fn new(store: &'a BlockStore<M>, acceptor: &'a A, shutdown: Arc<RwLock<bool>>) -> Self {
        let network = store.config().network;

        Importer {
            store,
            acceptor,
            magic: network_magic(network),
            genesis: genesis_block(Params::new(network)).block_hash(),
            shutdown,
            pending: RefCell::new(HashMap::new()),
        }
    }

    fn should_stop(&self) -> bool {
        *self.shutdown.read()
    }

    /// Reads one record at `frame_at`, making sure it's exactly one block
    fn load_record<'b>(
        &self,
        buf: &'b [u8],
        frame_at: usize,
    ) -> Result<(RawBlock<'b>, usize), BlockStoreError> {
        let frame = read_frame(buf, frame_at, self.magic)?;
        let block = RawBlock::new(&buf[frame.payload_offset..frame.end()])?;
        if !block.is_full_block() {
            return Err(BlockStoreError::Malformed("block"));
        }

        Ok((block, frame.payload_offset))
    }

    /// Hands a block to the acceptor, unless we already have it
    fn accept(
        &self,
        block: RawBlock<'_>,
        pos: Option<DiskPosition>,
        stats: &mut ImportStats,
    ) -> Result<(), BlockStoreError> {
        let hash = block.block_hash();
        let have_data = self.store.read_index(|index, _| {
            index
                .find(&hash)
                .map(|id| index[id].status.contains(BlockStatus::HAVE_DATA))
                .unwrap_or(false)
        });

        if have_data {
            stats.duplicates += 1;
            return Ok(());
        }

        match self.acceptor.accept_block(block, pos)? {
            Accepted::Stored(_) => stats.loaded += 1,
            Accepted::Duplicate => stats.duplicates += 1,
            Accepted::Rejected(hash) => {
                warn!("block {hash} is invalid");
                stats.rejected += 1;
            }
        }

        Ok(())
    }

    /// Puts a block aside until `parent` is imported
    fn defer(&self, parent: BlockHash, record: PendingRecord) {
        self.pending
            .borrow_mut()
            .entry(parent)
            .or_default()
            .push(record);
    }

    /// Imports everything that was waiting on `hash`, and on those, and so on
    ///
    /// Returns `false` if we were asked to stop.
    fn accept_children(
        &self,
        buf: &[u8],
        hash: BlockHash,
        stats: &mut ImportStats,
    ) -> Result<bool, BlockStoreError> {
        let mut queue = VecDeque::from([hash]);
        while let Some(parent) = queue.pop_front() {
            let children = self.pending.borrow_mut().remove(&parent);
            for child in children.unwrap_or_default() {
                if self.should_stop() {
                    return Ok(false);
                }

                let hash = match child {
                    PendingRecord::External(frame_at) => {
                        let (block, _) = self.load_record(buf, frame_at)?;
                        self.accept(block, None, stats)?;
                        block.block_hash()
                    }
                    PendingRecord::Stored(pos) => {
                        let data = self.store.load_block(pos)?;
                        let block = RawBlock::new(&data)?;
                        self.accept(block, Some(pos), stats)?;
                        block.block_hash()
                    }
                };

                queue.push_back(hash);
            }
        }

        Ok(true)
    }

    /// How many blocks are still waiting on a parent
    pub fn pending_count(&self) -> usize {
        self.pending.borrow().values().map(Vec::len).sum()
    }

    /// Forgets every waiting block matching `filter`, returning how many there were
    fn drop_pending(&self, filter: impl Fn(&PendingRecord) -> bool) -> usize {
        let mut pending = self.pending.borrow_mut();
        let mut dropped = 0;
        pending.retain(|_, children| {
            let before = children.len();
            children.retain(|child| !filter(child));
            dropped += before - children.len();
            !children.is_empty()
        });

        if dropped != 0 {
            warn!("{dropped} blocks never had their parent imported");
        }

        dropped
    }

    /// Imports every block in `buf`
    ///
    /// If `file_index` is set, `buf` is one of our own block files and blocks are already where
    /// they should be. Blocks from it still waiting on their parent once it ends are kept for
    /// later sources, and only counted as orphans by [Importer::reindex]. Anything else still
    /// waiting is forgotten here, and counted in [ImportStats::orphaned].
    pub fn import_source(&self, buf: &[u8], file_index: Option<u32>) -> ImportStats {
        let mut stats = ImportStats {
            sources: 1,
            ..Default::default()
        };

        let mut offset = 0;
        let result: Result<(), BlockStoreError> = loop {
            if self.should_stop() {
                info!("import interrupted");
                break Ok(());
            }

            let Some(frame_at) = find_next_frame(buf, offset, self.magic) else {
                break Ok(());
            };

            let (block, payload_offset) = match self.load_record(buf, frame_at) {
                Ok(record) => record,
                Err(e) => break Err(e),
            };
            offset = payload_offset + block.as_bytes().len();

            let position = file_index.map(|file| DiskPosition::new(file, payload_offset as u32));
            let hash = block.block_hash();
            let prev = block.prev_blockhash();
            if hash != self.genesis && !self.store.read_index(|index, _| index.is_known(&prev)) {
                debug!("block {hash} came before its parent {prev}");
                let record = match position {
                    Some(pos) => PendingRecord::Stored(pos),
                    None => PendingRecord::External(frame_at),
                };
                self.defer(prev, record);
                continue;
            }

            if let Err(e) = self.accept(block, position, &mut stats) {
                break Err(e);
            }

            match self.accept_children(buf, hash, &mut stats) {
                Ok(true) => {}
                Ok(false) => {
                    info!("import interrupted");
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = result {
            error!("stopped importing this source: {e}");
            stats.stopped += 1;
        }

        // offsets into `buf` mean nothing once we return
        stats.orphaned = self.drop_pending(|child| matches!(child, PendingRecord::External(_)));

        stats
    }

    /// Imports some file that isn't ours
    pub fn import_file(&self, path: &Path) -> Result<ImportStats, BlockStoreError> {
        info!("importing blocks from {}", path.display());
        let buf = MappedFileCache::map_external(path)?;

        let stats = self.import_source(&buf, None);
        self.store.flush()?;
        info!("imported {} blocks from {}", stats.loaded, path.display());

        Ok(stats)
    }

    /// Reads all our block files from the first one, until one is missing
    ///
    /// Once we're done, the reindex flag is cleared and we make sure genesis is there.
    pub fn reindex(&self) -> Result<ImportStats, BlockStoreError> {
        let mut stats = ImportStats::default();
        let mut file_index = 0;

        while let Some(buf) = self.store.load_block_file(file_index)? {
            if self.should_stop() {
                return Ok(stats);
            }

            info!("reindexing block file blk{file_index:05}.dat");
            stats.merge(self.import_source(&buf, Some(file_index)));
            self.store.flush()?;
            file_index += 1;
        }

        if self.should_stop() {
            return Ok(stats);
        }

        stats.orphaned += self.drop_pending(|_| true);
        self.store.set_reindexing(false)?;
        self.store.init_genesis()?;
        info!(
            "reindex done, {} blocks in {file_index} files",
            stats.loaded
        );

        Ok(stats)
    }

    /// Everything the block importer thread does
    ///
    /// Reindexes if asked to, then imports `bootstrap.dat` (and renames it so we don't do it
    /// again) and every `-loadblock` file. Missing files are just skipped.
    pub fn run(&self) -> Result<ImportStats, BlockStoreError> {
        let config = self.store.config();
        let mut stats = ImportStats::default();

        if self.store.is_reindexing() {
            stats.merge(self.reindex()?);
        }

        let bootstrap = PathBuf::from(&config.data_dir).join("bootstrap.dat");
        if bootstrap.exists() && !self.should_stop() {
            stats.merge(self.import_file(&bootstrap)?);

            let old = bootstrap.with_extension("dat.old");
            if let Err(e) = std::fs::rename(&bootstrap, &old) {
                warn!("could not rename {}: {e}", bootstrap.display());
            }
        }

        for file in config.load_block.iter() {
            if self.should_stop() {
                break;
            }

            let path = Path::new(file);
            if !path.exists() {
                warn!("could not open blocks file {file}");
                continue;
            }

            stats.merge(self.import_file(path)?);
        }

        if config.stop_after_import {
            info!("stopping after block import");
            *self.shutdown.write() = true;
        }

        Ok(stats)
    }
}

/// Runs the importer on its own thread
pub fn spawn_block_importer<M, A>(
    store: Arc<BlockStore<M>>,
    acceptor: Arc<A>,
    shutdown: Arc<RwLock<bool>>,
) -> Result<JoinHandle<Result<ImportStats, BlockStoreError>>, BlockStoreError>
where
    M: MetadataStore + Send + Sync + 'static,
    A: BlockAcceptor + Send + Sync + ?Sized + 'static,
{
    let handle = std::thread::Builder::new()
        .name("blockimporter".into())
        .spawn(move || Importer::new(&store, &*acceptor, shutdown).run())?;

    Ok(handle)
}
