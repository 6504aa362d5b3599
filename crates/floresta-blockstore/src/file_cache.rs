//! A cache of memory mapped block and undo files.
//!
//! We never copy a block out of its file: readers get a [BlockBuffer], which is a reference
//! counted view into a mapping. The cache only keeps weak references to mappings, so once every
//! buffer pointing into a file is dropped, that file gets unmapped.
//!
//! # Growing files
//!
//! A mapping never changes its length. When the [AppendWriter](crate::AppendWriter) extends a
//! file on disk, it **must** call [MappedFileCache::notify_grown] right after the resize. That
//! drops our cache entry for that file, so the next call to [MappedFileCache::map] creates a new
//! mapping that sees the new length. Buffers handed out before the resize keep working, files
//! grow but never move, they just don't see the new bytes.
//!
//! If someone resizes a file and forgets to call `notify_grown`, `map` keeps returning the old
//! length until every buffer for that file is released. We don't look at the file size on cache
//! hits, so this is on the writer.
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::ops::Deref;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;

use bitcoin::BlockHash;
use log::debug;
use log::warn;
use memmap2::MmapOptions;
use memmap2::MmapRaw;

use crate::disk::DiskPosition;
use crate::disk::StorageKind;
use crate::error::BlockStoreError;
use crate::record::undo_checksum;

type FileTable = HashMap<(StorageKind, u32), Weak<MappedFile>>;

/// One mapping of a block or undo file
///
/// The length is whatever the file had when we mapped it, and never changes.
#[derive(Debug)]
pub struct MappedFile {
    map: MmapRaw,
    writable: bool,
    path: PathBuf,
}

impl MappedFile {
    fn open(path: &Path, writable: bool) -> Result<MappedFile, BlockStoreError> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(BlockStoreError::EmptyFile(path.to_path_buf()));
        }

        let map = match writable {
            true => MmapOptions::new().map_raw(&file)?,
            false => MmapOptions::new().map_raw_read_only(&file)?,
        };

        Ok(MappedFile {
            map,
            writable,
            path: path.to_path_buf(),
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copies `bytes` into the mapping, starting at `offset`
    ///
    /// Only the append writer calls this, while holding its lock, and only past the append
    /// offset of this file. Readers never look past the append offset, so nobody is reading
    /// those bytes while we write them.
    pub(crate) fn write_at(&self, offset: usize, bytes: &[u8]) -> Result<(), BlockStoreError> {
        assert!(self.writable, "writing into a read-only mapping");
        assert!(
            offset + bytes.len() <= self.len(),
            "writing past the end of a mapping"
        );

        // SAFETY: we've checked that [offset, offset + bytes.len()) is inside the mapping, and
        // `bytes` can't alias the mapping, since it's only writable from here.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.map.as_mut_ptr().add(offset),
                bytes.len(),
            );
        }

        Ok(())
    }

    /// Asks the OS to write our dirty pages back to disk
    pub(crate) fn flush(&self) -> Result<(), BlockStoreError> {
        if self.writable {
            self.map.flush()?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
/// A zero-copy view into a mapped file
///
/// Holding one of those keeps the mapping alive, no lock needed. It derefs into the bytes it
/// covers.
pub struct BlockBuffer {
    file: Arc<MappedFile>,
    offset: usize,
    len: usize,
}

impl BlockBuffer {
    fn whole(file: Arc<MappedFile>) -> Self {
        let len = file.len();
        BlockBuffer {
            file,
            offset: 0,
            len,
        }
    }

    /// A narrower view into the same mapping. `offset` is relative to this buffer
    pub fn slice(&self, offset: usize, len: usize) -> BlockBuffer {
        assert!(offset + len <= self.len, "slicing past the end of a buffer");

        BlockBuffer {
            file: self.file.clone(),
            offset: self.offset + offset,
            len,
        }
    }

    /// The length of the mapping this view points into, as it was when we mapped it
    pub fn mapped_len(&self) -> usize {
        self.file.len()
    }

    /// Where this view starts inside its file
    pub fn file_offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn mapping(&self) -> &Arc<MappedFile> {
        &self.file
    }
}

impl Deref for BlockBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // SAFETY: offset + len is never past the end of the mapping (we check it on creation),
        // and the mapping lives as long as `self.file`.
        unsafe { std::slice::from_raw_parts(self.file.map.as_ptr().add(self.offset), self.len) }
    }
}

impl AsRef<[u8]> for BlockBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl PartialEq<[u8]> for BlockBuffer {
    fn eq(&self, other: &[u8]) -> bool {
        self.deref() == other
    }
}

/// Keeps track of every file we've mapped, and knows where to find them
pub struct MappedFileCache {
    /// Our own `blocks` directory
    blocks_dir: PathBuf,

    /// Other `blocks` directories we may read from, but never write to
    search_dirs: Vec<PathBuf>,

    /// The file currently being appended to, mapped read-write
    active_file: AtomicU32,

    files: Mutex<FileTable>,
}

impl MappedFileCache {
    pub fn new(blocks_dir: PathBuf, search_dirs: Vec<PathBuf>) -> Self {
        MappedFileCache {
            blocks_dir,
            search_dirs,
            active_file: AtomicU32::new(0),
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Where a file would live in our own directory, `{blocks_dir}/{prefix}{index:05}.dat`
    pub fn file_path(&self, kind: StorageKind, file_index: u32) -> PathBuf {
        Self::path_in(&self.blocks_dir, kind, file_index)
    }

    fn path_in(dir: &Path, kind: StorageKind, file_index: u32) -> PathBuf {
        dir.join(format!("{}{:05}.dat", kind.prefix(), file_index))
    }

    /// Finds a file on disk
    ///
    /// If it isn't in our directory and `find_harder` is set, we look into each extra directory,
    /// in order.
    pub fn find_file(
        &self,
        kind: StorageKind,
        file_index: u32,
        find_harder: bool,
    ) -> Option<PathBuf> {
        let path = self.file_path(kind, file_index);
        if path.exists() {
            return Some(path);
        }

        if !find_harder {
            return None;
        }

        self.search_dirs
            .iter()
            .map(|dir| Self::path_in(dir, kind, file_index))
            .find(|path| path.exists())
    }

    /// Tells the cache which file the writer is appending to. We map that one read-write
    pub fn set_active_file(&self, file_index: u32) {
        self.active_file.store(file_index, Ordering::SeqCst);
    }

    pub fn active_file(&self) -> u32 {
        self.active_file.load(Ordering::SeqCst)
    }

    /// Returns a buffer covering the whole file, and its length
    ///
    /// If we have a live mapping for this file, we just hand out another reference to it.
    /// Otherwise the file is opened (read-write if it's the active file, read-only if not) and
    /// mapped again.
    pub fn map(
        &self,
        kind: StorageKind,
        file_index: u32,
    ) -> Result<(BlockBuffer, usize), BlockStoreError> {
        let writable = file_index == self.active_file();
        let buffer = self.map_inner(kind, file_index, writable, false)?;
        let len = buffer.len();

        Ok((buffer, len))
    }

    /// Like [MappedFileCache::map], but the mapping is always writable, and always in our own
    /// directory. A cached read-only mapping gets replaced.
    pub(crate) fn map_for_write(
        &self,
        kind: StorageKind,
        file_index: u32,
    ) -> Result<BlockBuffer, BlockStoreError> {
        self.map_inner(kind, file_index, true, true)
    }

    fn map_inner(
        &self,
        kind: StorageKind,
        file_index: u32,
        writable: bool,
        must_write: bool,
    ) -> Result<BlockBuffer, BlockStoreError> {
        let mut files = self.files.lock()?;
        if let Some(file) = files.get(&(kind, file_index)).and_then(Weak::upgrade) {
            if !must_write || file.is_writable() {
                return Ok(BlockBuffer::whole(file));
            }
        }

        // only files in our own directory may be written to
        let path = self
            .find_file(kind, file_index, !must_write)
            .ok_or_else(|| {
                BlockStoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{}{:05}.dat not found", kind.prefix(), file_index),
                ))
            })?;
        let writable = writable && path.starts_with(&self.blocks_dir);

        let file = Arc::new(MappedFile::open(&path, writable)?);
        debug!(
            "mapped {} ({} bytes, writable: {writable})",
            path.display(),
            file.len()
        );

        files.retain(|_, entry| entry.strong_count() > 0);
        files.insert((kind, file_index), Arc::downgrade(&file));

        Ok(BlockBuffer::whole(file))
    }

    /// Forgets our mapping for a file that just grew
    ///
    /// This doesn't unmap anything, buffers we've handed out stay valid. The next call to
    /// [MappedFileCache::map] will see the new length.
    pub fn notify_grown(&self, kind: StorageKind, file_index: u32) -> Result<(), BlockStoreError> {
        self.files.lock()?.remove(&(kind, file_index));
        Ok(())
    }

    /// Reads the record at `pos`
    ///
    /// For undo records, if we know the hash of the block being undone, we check the trailing
    /// checksum too. The returned buffer covers exactly the payload.
    pub fn read(
        &self,
        pos: DiskPosition,
        kind: StorageKind,
        parent_hash: Option<&BlockHash>,
    ) -> Result<BlockBuffer, BlockStoreError> {
        let (file, file_size) = self.map(kind, pos.file_index)?;
        let offset = pos.byte_offset as usize;

        if offset < 4 {
            return Err(BlockStoreError::PositionTooSmall(pos));
        }

        if offset >= file_size {
            return Err(BlockStoreError::PositionOutOfFile { pos, file_size });
        }

        let mut size = [0; 4];
        size.copy_from_slice(&file[offset - 4..offset]);
        let size = u32::from_le_bytes(size);

        let end = offset + size as usize;
        if end + kind.trailer_size() > file_size {
            return Err(BlockStoreError::RecordOutOfBounds {
                pos,
                size,
                file_size,
            });
        }

        let payload = file.slice(offset, size as usize);
        if let (StorageKind::UndoData, Some(parent_hash)) = (kind, parent_hash) {
            let checksum = undo_checksum(parent_hash, &payload);
            if file[end..end + kind.trailer_size()] != checksum {
                warn!("undo data at {pos} doesn't match block {parent_hash}");
                return Err(BlockStoreError::ChecksumMismatch(pos));
            }
        }

        Ok(payload)
    }

    /// A buffer with a whole file, or `None` if we can't find it anywhere
    pub fn load_file(
        &self,
        kind: StorageKind,
        file_index: u32,
    ) -> Result<Option<BlockBuffer>, BlockStoreError> {
        if self.find_file(kind, file_index, true).is_none() {
            return Ok(None);
        }

        let (buffer, _) = self.map(kind, file_index)?;
        Ok(Some(buffer))
    }

    /// Maps some file that isn't one of ours, like a `bootstrap.dat`. This isn't cached
    pub fn map_external(path: &Path) -> Result<BlockBuffer, BlockStoreError> {
        let file = MappedFile::open(path, false)?;
        Ok(BlockBuffer::whole(Arc::new(file)))
    }
}

impl From<PoisonError<MutexGuard<'_, FileTable>>> for BlockStoreError {
    fn from(_: PoisonError<MutexGuard<'_, FileTable>>) -> Self {
        BlockStoreError::Poisoned
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;

    use bitcoin::hashes::Hash;

    use super::*;
    use crate::record::frame_header;

    fn test_dir() -> PathBuf {
        let dir = PathBuf::from(format!("./tmp-db/{}/blocks", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_file(path: &Path, contents: &[u8]) {
        let mut file = File::create(path).unwrap();
        file.write_all(contents).unwrap();
    }

    #[test]
    fn test_map_is_idempotent() {
        let dir = test_dir();
        let cache = MappedFileCache::new(dir.clone(), Vec::new());
        cache.set_active_file(7);
        write_file(&cache.file_path(StorageKind::BlockData, 0), &[1; 64]);

        let (first, len) = cache.map(StorageKind::BlockData, 0).unwrap();
        assert_eq!(len, 64);

        // the file grows behind our back, but nobody told us
        let file = OpenOptions::new()
            .write(true)
            .open(cache.file_path(StorageKind::BlockData, 0))
            .unwrap();
        file.set_len(128).unwrap();

        let (second, len) = cache.map(StorageKind::BlockData, 0).unwrap();
        assert_eq!(len, 64);
        assert!(Arc::ptr_eq(first.mapping(), second.mapping()));

        cache.notify_grown(StorageKind::BlockData, 0).unwrap();
        let (third, len) = cache.map(StorageKind::BlockData, 0).unwrap();
        assert_eq!(len, 128);

        // old buffers keep their length and their contents
        assert_eq!(first.len(), 64);
        assert_eq!(&first[..], &third[..64]);
    }

    #[test]
    fn test_unused_mappings_are_released() {
        let dir = test_dir();
        let cache = MappedFileCache::new(dir, Vec::new());
        write_file(&cache.file_path(StorageKind::BlockData, 0), &[1; 64]);

        let (buffer, _) = cache.map(StorageKind::BlockData, 0).unwrap();
        let weak = Arc::downgrade(buffer.mapping());
        drop(buffer);

        assert!(weak.upgrade().is_none());
        assert!(cache.map(StorageKind::BlockData, 0).is_ok());
    }

    #[test]
    fn test_empty_and_missing_files() {
        let dir = test_dir();
        let cache = MappedFileCache::new(dir, Vec::new());
        write_file(&cache.file_path(StorageKind::BlockData, 0), &[]);

        let err = cache.map(StorageKind::BlockData, 0).unwrap_err();
        assert!(matches!(err, BlockStoreError::EmptyFile(_)));
        let err = cache.map(StorageKind::BlockData, 1).unwrap_err();
        assert!(err.is_io());
        assert!(cache.load_file(StorageKind::BlockData, 1).unwrap().is_none());
    }

    #[test]
    fn test_find_harder() {
        let ours = test_dir();
        let theirs = test_dir();
        let cache = MappedFileCache::new(ours, vec![theirs.clone()]);
        cache.set_active_file(5);

        write_file(&theirs.join("blk00002.dat"), &[2; 16]);
        assert!(cache.find_file(StorageKind::BlockData, 2, false).is_none());
        assert_eq!(
            cache.find_file(StorageKind::BlockData, 2, true),
            Some(theirs.join("blk00002.dat"))
        );

        let (buffer, len) = cache.map(StorageKind::BlockData, 2).unwrap();
        assert_eq!(len, 16);
        assert!(!buffer.mapping().is_writable());
        assert!(cache.map_for_write(StorageKind::BlockData, 2).is_err());
    }

    #[test]
    fn test_read_checks() {
        let dir = test_dir();
        let cache = MappedFileCache::new(dir, Vec::new());
        cache.set_active_file(9);

        let magic = [0xfa, 0xbf, 0xb5, 0xda];
        let parent = BlockHash::all_zeros();
        let payload = b"some undo data";

        let mut contents = frame_header(magic, payload.len() as u32).to_vec();
        contents.extend_from_slice(payload);
        contents.extend_from_slice(&undo_checksum(&parent, payload));
        write_file(&cache.file_path(StorageKind::UndoData, 0), &contents);

        let pos = DiskPosition::new(0, 8);
        let read = cache.read(pos, StorageKind::UndoData, Some(&parent)).unwrap();
        assert_eq!(&read[..], payload);

        let other = BlockHash::from_byte_array([1; 32]);
        assert!(matches!(
            cache.read(pos, StorageKind::UndoData, Some(&other)),
            Err(BlockStoreError::ChecksumMismatch(_))
        ));

        assert!(matches!(
            cache.read(DiskPosition::new(0, 3), StorageKind::UndoData, None),
            Err(BlockStoreError::PositionTooSmall(_))
        ));
        assert!(matches!(
            cache.read(DiskPosition::new(0, 1_000), StorageKind::UndoData, None),
            Err(BlockStoreError::PositionOutOfFile { .. })
        ));

        // reading the payload as if it was a record makes the size nonsense
        assert!(matches!(
            cache.read(DiskPosition::new(0, 12), StorageKind::UndoData, None),
            Err(BlockStoreError::RecordOutOfBounds { .. })
        ));
    }
}
