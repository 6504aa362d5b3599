//! How records are laid out on disk, and how to find out how big a serialized block is without
//! deserializing it.
//!
//! Every record is preceded by an 8-byte frame header: four bytes of network magic followed by
//! the payload length as a little-endian u32. Undo records also carry a 32-byte checksum after the
//! payload, that is `sha256d(parent_hash || payload)`.
//!
//! ```text
//! | magic (4) | size (4) | payload (size) | checksum (32, undo only) |
//! ```
use bitcoin::block::Header;
use bitcoin::consensus::deserialize;
use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::hashes::HashEngine;
use bitcoin::Block;
use bitcoin::BlockHash;
use bitcoin::CompactTarget;
use bitcoin::Network;
use bitcoin::TxMerkleNode;

use crate::error::BlockStoreError;

/// Magic plus size
pub const FRAME_HEADER_SIZE: usize = 8;

/// The double-sha256 after every undo record
pub const UNDO_CHECKSUM_SIZE: usize = 32;

/// A serialized block header, nothing smaller than this can be a block
pub const BLOCK_HEADER_SIZE: usize = 80;

/// The four bytes in front of every record we write for `network`
pub fn network_magic(network: Network) -> [u8; 4] {
    network.magic().to_bytes()
}

/// Builds the 8-byte frame header for a payload of `size` bytes
pub fn frame_header(magic: [u8; 4], size: u32) -> [u8; FRAME_HEADER_SIZE] {
    let mut header = [0; FRAME_HEADER_SIZE];
    header[..4].copy_from_slice(&magic);
    header[4..].copy_from_slice(&size.to_le_bytes());
    header
}

/// The checksum stored after an undo record, committing to the block it undoes
pub fn undo_checksum(parent_hash: &BlockHash, payload: &[u8]) -> [u8; UNDO_CHECKSUM_SIZE] {
    let mut engine = sha256d::Hash::engine();
    engine.input(parent_hash.as_byte_array());
    engine.input(payload);

    sha256d::Hash::from_engine(engine).to_byte_array()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A frame we found inside some buffer
pub struct Frame {
    /// Where the payload starts, right after the frame header
    pub payload_offset: usize,

    /// How long the payload is
    pub size: u32,
}

impl Frame {
    /// Where the next frame would start
    pub fn end(&self) -> usize {
        self.payload_offset + self.size as usize
    }
}

/// Reads the frame header at `offset`
///
/// The size is only trusted after checking it fits in what's left of `buf`.
pub fn read_frame(buf: &[u8], offset: usize, magic: [u8; 4]) -> Result<Frame, BlockStoreError> {
    let available = buf.len().saturating_sub(offset);
    if available < FRAME_HEADER_SIZE {
        return Err(BlockStoreError::TruncatedRecord {
            offset,
            size: FRAME_HEADER_SIZE as u32,
            available,
        });
    }

    if buf[offset..offset + 4] != magic {
        return Err(BlockStoreError::BadMagic { offset });
    }

    let size = read_u32(buf, offset + 4);
    let available = available - FRAME_HEADER_SIZE;
    if size as usize > available {
        return Err(BlockStoreError::TruncatedRecord {
            offset,
            size,
            available,
        });
    }

    Ok(Frame {
        payload_offset: offset + FRAME_HEADER_SIZE,
        size,
    })
}

/// Hunts for the next thing that looks like a block frame, starting at `from`
///
/// Returns the offset of the magic. Frames claiming less than a block header are skipped, and
/// if we reach the end of `buf` we just return `None`. Whether the size fits in the buffer is
/// left for [read_frame] to decide.
pub fn find_next_frame(buf: &[u8], mut from: usize, magic: [u8; 4]) -> Option<usize> {
    while from + FRAME_HEADER_SIZE <= buf.len() {
        let found = buf[from..].windows(4).position(|window| window == magic)?;
        let offset = from + found;
        if offset + FRAME_HEADER_SIZE > buf.len() {
            return None;
        }

        if read_u32(buf, offset + 4) as usize >= BLOCK_HEADER_SIZE {
            return Some(offset);
        }

        from = offset + 1;
    }

    None
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

/// Moves `cursor` forward by `n` bytes, making sure we don't walk past `buf`
fn advance(
    buf: &[u8],
    cursor: usize,
    n: u64,
    what: &'static str,
) -> Result<usize, BlockStoreError> {
    let end = (cursor as u64)
        .checked_add(n)
        .ok_or(BlockStoreError::Malformed(what))?;

    if end > buf.len() as u64 {
        return Err(BlockStoreError::Malformed(what));
    }

    Ok(end as usize)
}

/// Reads a variable-length integer at `offset`
///
/// Values below 253 take a single byte, 253, 254 and 255 introduce a 2, 4 and 8 byte
/// little-endian value. Returns the value and the offset right after it.
pub fn read_compact_size(buf: &[u8], offset: usize) -> Result<(u64, usize), BlockStoreError> {
    let first = *buf
        .get(offset)
        .ok_or(BlockStoreError::Malformed("compact size"))?;

    let width = match first {
        0..=252 => return Ok((first as u64, offset + 1)),
        253 => 2,
        254 => 4,
        255 => 8,
    };

    let start = offset + 1;
    let end = advance(buf, start, width, "compact size")?;
    let mut bytes = [0; 8];
    bytes[..width as usize].copy_from_slice(&buf[start..end]);

    Ok((u64::from_le_bytes(bytes), end))
}

/// Skips a compact-size prefixed byte string
fn skip_var_bytes(buf: &[u8], offset: usize, what: &'static str) -> Result<usize, BlockStoreError> {
    let (len, cursor) = read_compact_size(buf, offset)?;
    advance(buf, cursor, len, what)
}

/// Computes how many bytes the transaction at `offset` takes, without allocating anything
///
/// Understands both the legacy and the segwit serialization.
pub fn transaction_size(buf: &[u8], offset: usize) -> Result<usize, BlockStoreError> {
    let mut cursor = advance(buf, offset, 4, "tx version")?;

    // segwit transactions have a zero where the input count would be, followed by a flag
    let segwit = buf.get(cursor) == Some(&0) && buf.get(cursor + 1) == Some(&1);
    if segwit {
        cursor += 2;
    }

    let (inputs, next) = read_compact_size(buf, cursor)?;
    cursor = next;
    for _ in 0..inputs {
        cursor = advance(buf, cursor, 36, "tx input")?; // outpoint
        cursor = skip_var_bytes(buf, cursor, "tx input script")?;
        cursor = advance(buf, cursor, 4, "tx input sequence")?;
    }

    let (outputs, next) = read_compact_size(buf, cursor)?;
    cursor = next;
    for _ in 0..outputs {
        cursor = advance(buf, cursor, 8, "tx output value")?;
        cursor = skip_var_bytes(buf, cursor, "tx output script")?;
    }

    if segwit {
        for _ in 0..inputs {
            let (items, next) = read_compact_size(buf, cursor)?;
            cursor = next;
            for _ in 0..items {
                cursor = skip_var_bytes(buf, cursor, "tx witness")?;
            }
        }
    }

    let end = advance(buf, cursor, 4, "tx locktime")?;
    Ok(end - offset)
}

/// Walks a whole serialized block, returning the offset of every transaction relative to the
/// start of the block, and the total size.
pub fn walk_block(buf: &[u8]) -> Result<(Vec<usize>, usize), BlockStoreError> {
    let cursor = advance(buf, 0, BLOCK_HEADER_SIZE as u64, "block header")?;
    let (count, mut cursor) = read_compact_size(buf, cursor)?;

    // a bogus count shouldn't make us allocate the world
    let mut offsets = Vec::with_capacity(count.min(buf.len() as u64 / 60) as usize);
    for _ in 0..count {
        offsets.push(cursor);
        cursor += transaction_size(buf, cursor)?;
    }

    Ok((offsets, cursor))
}

#[derive(Debug, Clone, Copy)]
/// A zero-copy view over a serialized block
///
/// This is what we get from disk, we don't want to deserialize the whole thing just to know its
/// hash or who its parent is.
pub struct RawBlock<'a> {
    data: &'a [u8],
}

impl<'a> RawBlock<'a> {
    /// Wraps a serialized block. Only the header is checked here
    pub fn new(data: &'a [u8]) -> Result<Self, BlockStoreError> {
        if data.len() < BLOCK_HEADER_SIZE {
            return Err(BlockStoreError::Malformed("block header"));
        }

        Ok(RawBlock { data })
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn version(&self) -> i32 {
        read_u32(self.data, 0) as i32
    }

    pub fn prev_blockhash(&self) -> BlockHash {
        BlockHash::from_byte_array(self.hash_at(4))
    }

    pub fn merkle_root(&self) -> TxMerkleNode {
        TxMerkleNode::from_byte_array(self.hash_at(36))
    }

    pub fn time(&self) -> u32 {
        read_u32(self.data, 68)
    }

    pub fn bits(&self) -> CompactTarget {
        CompactTarget::from_consensus(read_u32(self.data, 72))
    }

    pub fn nonce(&self) -> u32 {
        read_u32(self.data, 76)
    }

    /// The double-sha256 of the 80-byte header
    pub fn block_hash(&self) -> BlockHash {
        BlockHash::from_raw_hash(sha256d::Hash::hash(&self.data[..BLOCK_HEADER_SIZE]))
    }

    pub fn header(&self) -> Result<Header, BlockStoreError> {
        Ok(deserialize(&self.data[..BLOCK_HEADER_SIZE])?)
    }

    /// Whether this buffer holds a complete block, and nothing after it
    pub fn is_full_block(&self) -> bool {
        if self.data.len() <= BLOCK_HEADER_SIZE {
            return false;
        }

        matches!(walk_block(self.data), Ok((_, size)) if size == self.data.len())
    }

    /// Where each transaction starts, counting from the end of the header
    pub fn tx_offsets(&self) -> Result<Vec<u32>, BlockStoreError> {
        let (offsets, _) = walk_block(self.data)?;
        Ok(offsets
            .into_iter()
            .map(|offset| (offset - BLOCK_HEADER_SIZE) as u32)
            .collect())
    }

    /// Deserializes the whole block
    pub fn to_block(&self) -> Result<Block, BlockStoreError> {
        Ok(deserialize(self.data)?)
    }

    fn hash_at(&self, offset: usize) -> [u8; 32] {
        let mut hash = [0; 32];
        hash.copy_from_slice(&self.data[offset..offset + 32]);
        hash
    }
}
