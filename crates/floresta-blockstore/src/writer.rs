//! Appends framed records to block and undo files.
//!
//! Writes are append only: we pick the file, make sure it has room for the record, copy the
//! frame header, payload and (for undo data) checksum, and only then move the append offset
//! forward. A single lock serializes all of that, so there's never two writes into the same
//! region, and readers never see a record before it's complete.
//!
//! Files are grown in chunks, every time we resize one, we tell the [MappedFileCache] about it
//! before mapping it again. Forgetting to do so would give us a stale mapping that is too short.
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use bitcoin::BlockHash;
use log::debug;
use log::info;

use crate::config::BlockStoreConfig;
use crate::disk::BlockFileInfo;
use crate::disk::DiskPosition;
use crate::disk::StorageKind;
use crate::error::BlockStoreError;
use crate::file_cache::BlockBuffer;
use crate::file_cache::MappedFileCache;
use crate::record::frame_header;
use crate::record::network_magic;
use crate::record::undo_checksum;
use crate::record::RawBlock;
use crate::record::FRAME_HEADER_SIZE;

#[derive(Debug, Default)]
struct WriterState {
    /// The block file we are appending to
    last_file: u32,

    /// What we know about each file, indexed by file number
    files: Vec<BlockFileInfo>,

    /// Files that changed since the last flush
    dirty: BTreeSet<u32>,

    /// The last mapping we've used for each kind, so we don't remap on every write
    held: HashMap<StorageKind, (u32, BlockBuffer)>,
}

impl WriterState {
    fn info_mut(&mut self, file_index: u32) -> &mut BlockFileInfo {
        let idx = file_index as usize;
        if self.files.len() <= idx {
            self.files.resize(idx + 1, BlockFileInfo::default());
        }

        &mut self.files[idx]
    }
}

/// The only thing that writes into our files
pub struct AppendWriter {
    cache: Arc<MappedFileCache>,
    magic: [u8; 4],
    max_file_size: u32,
    block_chunk: u32,
    undo_chunk: u32,
    state: Mutex<WriterState>,
}

impl AppendWriter {
    pub fn new(cache: Arc<MappedFileCache>, config: &BlockStoreConfig) -> Self {
        AppendWriter {
            cache,
            magic: network_magic(config.network),
            max_file_size: config.max_blockfile_size(),
            block_chunk: config.chunk_size(StorageKind::BlockData),
            undo_chunk: config.chunk_size(StorageKind::UndoData),
            state: Mutex::new(WriterState::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, WriterState>, BlockStoreError> {
        self.state.lock().map_err(|_| BlockStoreError::Poisoned)
    }

    /// Sets our state from what we've persisted in the metadata database
    pub fn restore(
        &self,
        last_file: u32,
        files: Vec<BlockFileInfo>,
    ) -> Result<(), BlockStoreError> {
        let mut state = self.state()?;
        state.last_file = last_file;
        state.files = files;
        state.dirty.clear();
        state.held.clear();
        self.cache.set_active_file(last_file);

        Ok(())
    }

    pub fn last_file(&self) -> Result<u32, BlockStoreError> {
        Ok(self.state()?.last_file)
    }

    pub fn file_info(&self, file_index: u32) -> Result<Option<BlockFileInfo>, BlockStoreError> {
        Ok(self.state()?.files.get(file_index as usize).copied())
    }

    fn chunk_size(&self, kind: StorageKind) -> u32 {
        match kind {
            StorageKind::BlockData => self.block_chunk,
            StorageKind::UndoData => self.undo_chunk,
        }
    }

    /// Appends one record
    ///
    /// Block data always goes to the active block file, we start a new one if this record
    /// wouldn't fit. Undo data goes into `target_file`, that should be the file holding the block
    /// being undone, and must come with the hash of that block's parent. Returns a buffer with the
    /// payload we just wrote, and where it starts.
    ///
    /// # Panics
    ///
    /// If the payload can't fit in a block file, or if undo data comes without a parent hash.
    pub fn write(
        &self,
        kind: StorageKind,
        height: Option<u32>,
        payload: &[u8],
        target_file: Option<u32>,
        parent_hash: Option<&BlockHash>,
    ) -> Result<(BlockBuffer, DiskPosition), BlockStoreError> {
        assert!(
            payload.len() < (self.max_file_size as usize).saturating_sub(FRAME_HEADER_SIZE),
            "a {} bytes record can't fit in a {} bytes file",
            payload.len(),
            self.max_file_size
        );
        assert!(
            kind == StorageKind::BlockData || parent_hash.is_some(),
            "undo records must commit to a parent hash"
        );

        let record_size = FRAME_HEADER_SIZE + payload.len() + kind.trailer_size();
        let mut state = self.state()?;

        let file_index = match kind {
            StorageKind::BlockData => {
                let last_file = state.last_file;
                let used = state.info_mut(last_file).size as usize;
                if used != 0 && used + record_size > self.max_file_size as usize {
                    state.last_file += 1;
                    self.cache.set_active_file(state.last_file);
                    info!("starting block file {}", state.last_file);
                }

                state.last_file
            }
            StorageKind::UndoData => target_file.unwrap_or(state.last_file),
        };

        let offset = match kind {
            StorageKind::BlockData => state.info_mut(file_index).size,
            StorageKind::UndoData => state.info_mut(file_index).undo_size,
        } as usize;

        let mut file = self.map_with_room(&mut state, kind, file_index, offset + record_size)?;

        let payload_offset = offset + FRAME_HEADER_SIZE;
        let mapping = file.mapping().clone();
        mapping.write_at(offset, &frame_header(self.magic, payload.len() as u32))?;
        mapping.write_at(payload_offset, payload)?;
        if let (StorageKind::UndoData, Some(parent_hash)) = (kind, parent_hash) {
            let checksum = undo_checksum(parent_hash, payload);
            mapping.write_at(payload_offset + payload.len(), &checksum)?;
        }

        // the record is complete, now it can be seen
        let info = state.info_mut(file_index);
        match kind {
            StorageKind::BlockData => {
                info.size = (offset + record_size) as u32;
                if let Some(height) = height {
                    let time = RawBlock::new(payload).map(|block| block.time()).unwrap_or(0);
                    info.add_block(height, time);
                }
            }
            StorageKind::UndoData => info.undo_size = (offset + record_size) as u32,
        }
        state.dirty.insert(file_index);

        file = file.slice(payload_offset, payload.len());
        Ok((file, DiskPosition::new(file_index, payload_offset as u32)))
    }

    /// Maps `file_index` for writing, creating or growing it until it has at least `needed`
    /// bytes.
    fn map_with_room(
        &self,
        state: &mut WriterState,
        kind: StorageKind,
        file_index: u32,
        needed: usize,
    ) -> Result<BlockBuffer, BlockStoreError> {
        let held = state
            .held
            .get(&kind)
            .filter(|(idx, _)| *idx == file_index)
            .map(|(_, buffer)| buffer.clone());

        let buffer = match held {
            Some(buffer) if buffer.mapped_len() >= needed => buffer,
            _ => {
                let chunk = self.chunk_size(kind) as usize;
                let path = self.cache.file_path(kind, file_index);
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?;

                let current = file.metadata()?.len() as usize;
                if current < needed {
                    // new files get at least one chunk, old ones grow by whole chunks
                    let new_len = match current {
                        0 => needed.max(chunk),
                        _ => current + (needed - current).div_ceil(chunk) * chunk,
                    };
                    file.set_len(new_len as u64)?;
                    debug!("grew {} from {current} to {new_len} bytes", path.display());

                    // drop our own reference too, or the stale mapping would stay alive
                    state.held.remove(&kind);
                    self.cache.notify_grown(kind, file_index)?;
                }

                let buffer = self.cache.map_for_write(kind, file_index)?;
                if buffer.mapped_len() >= needed {
                    buffer
                } else {
                    // someone is still holding an older, shorter mapping
                    self.cache.notify_grown(kind, file_index)?;
                    self.cache.map_for_write(kind, file_index)?
                }
            }
        };

        state.held.insert(kind, (file_index, buffer.clone()));
        Ok(buffer)
    }

    /// Accounts for a block that is already in our files, like the ones we find while
    /// reindexing. New blocks will be appended after it.
    pub fn note_existing(
        &self,
        pos: DiskPosition,
        size: u32,
        height: u32,
        time: u32,
    ) -> Result<(), BlockStoreError> {
        let mut state = self.state()?;
        if pos.file_index > state.last_file {
            state.last_file = pos.file_index;
            self.cache.set_active_file(pos.file_index);
        }

        let info = state.info_mut(pos.file_index);
        info.size = info.size.max(pos.byte_offset + size);
        info.add_block(height, time);
        state.dirty.insert(pos.file_index);

        Ok(())
    }

    /// Flushes every file we've written to since last time
    ///
    /// Returns the infos for those files and the current block file, so they can be persisted.
    pub fn flush(&self) -> Result<(Vec<(u32, BlockFileInfo)>, u32), BlockStoreError> {
        let mut state = self.state()?;

        let dirty = std::mem::take(&mut state.dirty);
        let mut infos = Vec::with_capacity(dirty.len());
        for file_index in dirty {
            for kind in [StorageKind::BlockData, StorageKind::UndoData] {
                if self.cache.find_file(kind, file_index, false).is_some() {
                    self.cache.map_for_write(kind, file_index)?.mapping().flush()?;
                }
            }

            infos.push((file_index, *state.info_mut(file_index)));
        }

        Ok((infos, state.last_file))
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;
    use bitcoin::Network;

    use super::*;

    fn writer(max_file_size: u32, chunk: u32) -> (Arc<MappedFileCache>, AppendWriter) {
        let dir = format!("./tmp-db/{}", rand::random::<u64>());
        let mut config = BlockStoreConfig::new(dir).with_network(Network::Regtest);
        config.max_blockfile_size = Some(max_file_size);
        config.blockfile_chunk_size = Some(chunk);
        config.undofile_chunk_size = Some(chunk);

        std::fs::create_dir_all(config.blocks_dir()).unwrap();
        let cache = Arc::new(MappedFileCache::new(config.blocks_dir(), Vec::new()));
        let writer = AppendWriter::new(cache.clone(), &config);

        (cache, writer)
    }

    #[test]
    fn test_write_positions() {
        let (cache, writer) = writer(1 << 20, 1 << 16);

        let first = [1u8; 100];
        let second = [2u8; 120];
        let (buffer, pos) = writer
            .write(StorageKind::BlockData, None, &first, None, None)
            .unwrap();
        assert_eq!(pos, DiskPosition::new(0, 8));
        assert_eq!(&buffer[..], &first[..]);

        let (_, pos2) = writer
            .write(StorageKind::BlockData, None, &second, None, None)
            .unwrap();
        assert_eq!(pos2, DiskPosition::new(0, 116));

        let read = cache.read(pos, StorageKind::BlockData, None).unwrap();
        assert_eq!(&read[..], &first[..]);
        let read = cache.read(pos2, StorageKind::BlockData, None).unwrap();
        assert_eq!(&read[..], &second[..]);
    }

    #[test]
    fn test_growth_is_visible() {
        let (cache, writer) = writer(1 << 20, 256);

        let mut last = 0;
        for i in 0..10u8 {
            let (_, pos) = writer
                .write(StorageKind::BlockData, Some(i as u32), &[i; 90], None, None)
                .unwrap();

            assert!(pos.byte_offset > last);
            last = pos.byte_offset;

            let (_, len) = cache.map(StorageKind::BlockData, 0).unwrap();
            assert!(len >= (pos.byte_offset + 90) as usize);
            assert_eq!(len % 256, 0);
        }

        let info = writer.file_info(0).unwrap().unwrap();
        assert_eq!(info.blocks, 10);
        assert_eq!(info.size, 980);
        assert_eq!((info.height_first, info.height_last), (0, 9));
    }

    #[test]
    fn test_file_rotation() {
        let (_, writer) = writer(256, 128);

        let (_, first) = writer
            .write(StorageKind::BlockData, Some(0), &[0; 100], None, None)
            .unwrap();
        let (_, second) = writer
            .write(StorageKind::BlockData, Some(1), &[1; 100], None, None)
            .unwrap();
        let (_, third) = writer
            .write(StorageKind::BlockData, Some(2), &[2; 100], None, None)
            .unwrap();

        assert_eq!(first, DiskPosition::new(0, 8));
        assert_eq!(second, DiskPosition::new(0, 116));
        assert_eq!(third, DiskPosition::new(1, 8));
        assert_eq!(writer.last_file().unwrap(), 1);

        let (infos, last_file) = writer.flush().unwrap();
        assert_eq!(last_file, 1);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].1.blocks, 2);

        // nothing changed since
        assert!(writer.flush().unwrap().0.is_empty());
    }

    #[test]
    fn test_undo_records() {
        let (cache, writer) = writer(1 << 20, 1 << 10);
        let parent = BlockHash::from_byte_array([7; 32]);

        writer
            .write(StorageKind::BlockData, Some(1), &[1; 100], None, None)
            .unwrap();
        let (_, pos) = writer
            .write(StorageKind::UndoData, None, b"undo", Some(0), Some(&parent))
            .unwrap();
        assert_eq!(pos, DiskPosition::new(0, 8));

        let info = writer.file_info(0).unwrap().unwrap();
        assert_eq!(info.undo_size, 8 + 4 + 32);

        let read = cache.read(pos, StorageKind::UndoData, Some(&parent)).unwrap();
        assert_eq!(&read[..], b"undo");
        assert!(cache
            .read(pos, StorageKind::UndoData, Some(&BlockHash::all_zeros()))
            .is_err());
    }

    #[test]
    #[should_panic]
    fn test_record_too_big() {
        let (_, writer) = writer(256, 128);
        let _ = writer.write(StorageKind::BlockData, None, &[0; 250], None, None);
    }
}
