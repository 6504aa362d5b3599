//! Errors returned by the block store.
//!
//! We have three kinds of failure here: data corruption (a record that doesn't look like what we
//! wrote), I/O failures (we can't open, resize or map a file) and errors coming from the metadata
//! database. Corruption only fails the operation that found it, I/O errors are fatal for the
//! operation being attempted, and callers decide whether to retry or give up.
use core::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::path::PathBuf;

use bitcoin::BlockHash;

use crate::disk::DiskPosition;
use crate::impl_error_from;

/// Any error coming from a [MetadataStore](crate::MetadataStore) backend
pub trait DatabaseError: Debug + Send + Sync + 'static {}

#[derive(Debug)]
pub enum BlockStoreError {
    /// We couldn't open, resize or map some file
    Io(std::io::Error),

    /// A record position that can't be right, every record is preceded by an 8-byte header
    PositionTooSmall(DiskPosition),

    /// The record starts after the end of its file
    PositionOutOfFile { pos: DiskPosition, file_size: usize },

    /// The size stored in the frame header goes beyond the end of the file
    RecordOutOfBounds {
        pos: DiskPosition,
        size: u32,
        file_size: usize,
    },

    /// The checksum after an undo record doesn't commit to this payload and parent hash
    ChecksumMismatch(DiskPosition),

    /// We expected a network magic at this offset, but found something else
    BadMagic { offset: usize },

    /// A frame claims more bytes than what is left in the buffer
    TruncatedRecord {
        offset: usize,
        size: u32,
        available: usize,
    },

    /// Some length prefix inside a serialized block or transaction goes past its buffer
    Malformed(&'static str),

    /// We tried to map a file that has no bytes on it
    EmptyFile(PathBuf),

    /// A block that doesn't connect to anything we know
    UnknownParent(BlockHash),

    /// We couldn't find what we were looking for
    NotFound,

    /// One of our locks is poisoned
    Poisoned,

    /// Error while decoding some metadata record
    ConsensusDecode(bitcoin::consensus::encode::Error),

    /// Our config file isn't valid toml
    Config(toml::de::Error),

    /// Our metadata database returned an error
    Database(Box<dyn DatabaseError>),
}

impl BlockStoreError {
    /// Whether this error means the data we have is broken. Those errors fail only the read or
    /// import that found them, never the whole process.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            BlockStoreError::PositionTooSmall(_)
                | BlockStoreError::PositionOutOfFile { .. }
                | BlockStoreError::RecordOutOfBounds { .. }
                | BlockStoreError::ChecksumMismatch(_)
                | BlockStoreError::BadMagic { .. }
                | BlockStoreError::TruncatedRecord { .. }
                | BlockStoreError::Malformed(_)
                | BlockStoreError::ConsensusDecode(_)
        )
    }

    /// Whether this error came from the file system
    pub fn is_io(&self) -> bool {
        matches!(self, BlockStoreError::Io(_) | BlockStoreError::EmptyFile(_))
    }
}

impl Display for BlockStoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockStoreError::Io(e) => write!(f, "I/O error: {e}"),
            BlockStoreError::PositionTooSmall(pos) => {
                write!(f, "database corruption: record position {pos} is too small")
            }
            BlockStoreError::PositionOutOfFile { pos, file_size } => {
                write!(f, "position {pos} is outside of the file ({file_size} bytes)")
            }
            BlockStoreError::RecordOutOfBounds {
                pos,
                size,
                file_size,
            } => write!(
                f,
                "record at {pos} claims {size} bytes, bigger than the file ({file_size} bytes)"
            ),
            BlockStoreError::ChecksumMismatch(pos) => {
                write!(f, "undo record at {pos} has a checksum mismatch")
            }
            BlockStoreError::BadMagic { offset } => {
                write!(f, "no network magic at offset {offset}")
            }
            BlockStoreError::TruncatedRecord {
                offset,
                size,
                available,
            } => write!(
                f,
                "record at offset {offset} claims {size} bytes, but only {available} are left"
            ),
            BlockStoreError::Malformed(what) => write!(f, "malformed data: {what}"),
            BlockStoreError::EmptyFile(path) => write!(f, "file {} is empty", path.display()),
            BlockStoreError::UnknownParent(hash) => {
                write!(f, "block {hash} doesn't connect to any known header")
            }
            BlockStoreError::NotFound => write!(f, "not found"),
            BlockStoreError::Poisoned => write!(f, "a lock is poisoned"),
            BlockStoreError::ConsensusDecode(e) => write!(f, "decoding error: {e}"),
            BlockStoreError::Config(e) => write!(f, "invalid config file: {e}"),
            BlockStoreError::Database(e) => write!(f, "database error: {e:?}"),
        }
    }
}

impl std::error::Error for BlockStoreError {}

impl<T: DatabaseError> From<T> for BlockStoreError {
    fn from(value: T) -> Self {
        BlockStoreError::Database(Box::new(value))
    }
}

impl_error_from!(BlockStoreError, std::io::Error, Io);
impl_error_from!(
    BlockStoreError,
    bitcoin::consensus::encode::Error,
    ConsensusDecode
);
impl_error_from!(BlockStoreError, toml::de::Error, Config);

#[cfg(feature = "kv-store")]
impl DatabaseError for kv::Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let pos = DiskPosition::new(0, 2);
        assert!(BlockStoreError::PositionTooSmall(pos).is_corruption());
        assert!(BlockStoreError::ChecksumMismatch(pos).is_corruption());
        assert!(BlockStoreError::Malformed("tx").is_corruption());

        let io = BlockStoreError::from(std::io::Error::other("disk on fire"));
        assert!(io.is_io());
        assert!(!io.is_corruption());
        assert!(!BlockStoreError::Poisoned.is_io());
    }
}
