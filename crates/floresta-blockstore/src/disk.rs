//! Small types describing where things live on disk, and how we persist them in the metadata
//! database.
use std::fmt::Display;
use std::fmt::Formatter;

use bitcoin::consensus::encode::Error as EncodeError;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::io::Read;
use bitcoin::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// What kind of record a file holds
///
/// Blocks go into `blk?????.dat` files, undo data into `rev?????.dat`. Undo records are followed
/// by a 32-byte checksum that commits to the hash of the block they undo, block records aren't.
pub enum StorageKind {
    BlockData,
    UndoData,
}

impl StorageKind {
    /// The filename prefix for this kind of file
    pub fn prefix(&self) -> &'static str {
        match self {
            StorageKind::BlockData => "blk",
            StorageKind::UndoData => "rev",
        }
    }

    /// How many bytes follow the payload of each record
    pub fn trailer_size(&self) -> usize {
        match self {
            StorageKind::BlockData => 0,
            StorageKind::UndoData => crate::record::UNDO_CHECKSUM_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Where a record's payload starts: the file number and the byte offset inside it
///
/// The offset always points right after the 8-byte frame header, so the payload size can be read
/// from the four bytes before it.
pub struct DiskPosition {
    pub file_index: u32,
    pub byte_offset: u32,
}

impl DiskPosition {
    pub fn new(file_index: u32, byte_offset: u32) -> Self {
        DiskPosition {
            file_index,
            byte_offset,
        }
    }
}

impl Display for DiskPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_index, self.byte_offset)
    }
}

impl Encodable for DiskPosition {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> bitcoin::io::Result<usize> {
        let mut len = self.file_index.consensus_encode(writer)?;
        len += self.byte_offset.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Decodable for DiskPosition {
    fn consensus_decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self, EncodeError> {
        let file_index = u32::consensus_decode(reader)?;
        let byte_offset = u32::consensus_decode(reader)?;
        Ok(DiskPosition::new(file_index, byte_offset))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The position of a transaction: the block it's in, and how far after the block header it
/// starts
pub struct DiskTxPos {
    pub block: DiskPosition,
    pub tx_offset: u32,
}

impl Encodable for DiskTxPos {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> bitcoin::io::Result<usize> {
        let mut len = self.block.consensus_encode(writer)?;
        len += self.tx_offset.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Decodable for DiskTxPos {
    fn consensus_decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self, EncodeError> {
        Ok(DiskTxPos {
            block: DiskPosition::consensus_decode(reader)?,
            tx_offset: u32::consensus_decode(reader)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Bookkeeping for one pair of blk/rev files
pub struct BlockFileInfo {
    /// How many blocks are stored in this file
    pub blocks: u32,

    /// Bytes used in the block file, this is where the next record will be appended
    pub size: u32,

    /// Bytes used in the undo file
    pub undo_size: u32,

    /// Lowest height of a block in this file
    pub height_first: u32,

    /// Highest height of a block in this file
    pub height_last: u32,

    /// Earliest block timestamp in this file
    pub time_first: u32,

    /// Latest block timestamp in this file
    pub time_last: u32,
}

impl BlockFileInfo {
    /// Accounts for one more block stored in this file
    pub fn add_block(&mut self, height: u32, time: u32) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if self.blocks == 0 || time < self.time_first {
            self.time_first = time;
        }

        self.blocks += 1;
        self.height_last = self.height_last.max(height);
        self.time_last = self.time_last.max(time);
    }
}

impl Encodable for BlockFileInfo {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> bitcoin::io::Result<usize> {
        let mut len = 0;
        len += self.blocks.consensus_encode(writer)?;
        len += self.size.consensus_encode(writer)?;
        len += self.undo_size.consensus_encode(writer)?;
        len += self.height_first.consensus_encode(writer)?;
        len += self.height_last.consensus_encode(writer)?;
        len += self.time_first.consensus_encode(writer)?;
        len += self.time_last.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Decodable for BlockFileInfo {
    fn consensus_decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self, EncodeError> {
        Ok(BlockFileInfo {
            blocks: u32::consensus_decode(reader)?,
            size: u32::consensus_decode(reader)?,
            undo_size: u32::consensus_decode(reader)?,
            height_first: u32::consensus_decode(reader)?,
            height_last: u32::consensus_decode(reader)?,
            time_first: u32::consensus_decode(reader)?,
            time_last: u32::consensus_decode(reader)?,
        })
    }
}
