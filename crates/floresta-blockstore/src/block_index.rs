//! The block index, holding every header we've ever seen, and the header chain, our view of
//! which fork is the best one.
//!
//! Nodes live in an arena and are never removed, everything else refers to them by [NodeId].
//! A node is created the first time we hear about its hash, be it from the header itself or from
//! a child naming it as parent. The latter creates a placeholder, without header or height, that
//! gets filled once the actual header shows up.
//!
//! The [HeaderChain] keeps one tip for each fork we know about, and a height-indexed view of the
//! fork with most work. Ties are broken in favour of whatever we saw first, a fork needs strictly
//! more work to take over.
use std::collections::HashMap;
use std::ops::Index;

use bitcoin::block::Header;
use bitcoin::consensus::encode::Error as EncodeError;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::Hash;
use bitcoin::io::Read;
use bitcoin::io::Write;
use bitcoin::BlockHash;
use bitcoin::Work;
use log::info;

use crate::disk::DiskPosition;
use crate::error::BlockStoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// A stable handle to a node inside a [BlockIndex]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// What we know about a block, as a set of flags
pub struct BlockStatus(u32);

impl BlockStatus {
    /// We've only heard about this hash
    pub const UNKNOWN: BlockStatus = BlockStatus(0);

    /// The header connects to our tree
    pub const VALID_HEADER: BlockStatus = BlockStatus(1);

    /// We have the full block on disk
    pub const HAVE_DATA: BlockStatus = BlockStatus(8);

    /// We have undo data on disk
    pub const HAVE_UNDO: BlockStatus = BlockStatus(16);

    /// This block failed validation
    pub const FAILED_VALID: BlockStatus = BlockStatus(32);

    /// Some ancestor of this block failed validation
    pub const FAILED_CHILD: BlockStatus = BlockStatus(64);

    const FAILED_MASK: u32 = Self::FAILED_VALID.0 | Self::FAILED_CHILD.0;

    pub fn from_bits(bits: u32) -> Self {
        BlockStatus(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: BlockStatus) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BlockStatus) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BlockStatus) {
        self.0 &= !other.0;
    }

    pub fn is_failed(&self) -> bool {
        self.0 & Self::FAILED_MASK != 0
    }
}

#[derive(Debug, Clone)]
pub struct BlockIndexNode {
    pub hash: BlockHash,

    /// Our parent, if we know it. This is a back reference, the arena owns every node
    pub prev: Option<NodeId>,

    pub height: u32,

    /// Total work from genesis up to this block
    pub chain_work: Work,

    pub status: BlockStatus,

    /// Where the block is stored, if we have it
    pub data_pos: Option<DiskPosition>,

    /// Where the undo data is stored, if we have it
    pub undo_pos: Option<DiskPosition>,

    /// Some ancestor further back, used to speed up [BlockIndex::get_ancestor]
    pub skip: Option<NodeId>,

    /// The header, `None` for nodes we only know by hash
    pub header: Option<Header>,

    /// How many transactions this block has, zero if we don't have it
    pub tx_count: u32,
}

impl BlockIndexNode {
    fn placeholder(hash: BlockHash) -> Self {
        BlockIndexNode {
            hash,
            prev: None,
            height: 0,
            chain_work: Work::from_be_bytes([0; 32]),
            status: BlockStatus::UNKNOWN,
            data_pos: None,
            undo_pos: None,
            skip: None,
            header: None,
            tx_count: 0,
        }
    }

    /// Whether this header is linked into our tree, not just a hash we've heard of
    pub fn is_known(&self) -> bool {
        self.status.contains(BlockStatus::VALID_HEADER)
    }

    pub fn is_valid(&self) -> bool {
        !self.status.is_failed()
    }
}

/// Turns the lowest set bit of `n` off
fn invert_lowest_one(n: u32) -> u32 {
    n & n.wrapping_sub(1)
}

/// Which height a node at `height` should have its skip pointer pointing to
///
/// Any number that decreases fast enough works here, this one gives us `O(log n)` jumps for
/// [BlockIndex::get_ancestor].
pub fn skip_height(height: u32) -> u32 {
    if height < 2 {
        return 0;
    }

    // odd heights point further back, so we don't always take the same jumps
    if height & 1 != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

#[derive(Debug, Default)]
/// Every block we've heard of, in an append-only arena
pub struct BlockIndex {
    nodes: Vec<BlockIndexNode>,
    by_hash: HashMap<BlockHash, NodeId>,
}

impl BlockIndex {
    pub fn new() -> Self {
        BlockIndex::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, hash: &BlockHash) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    /// Whether this hash is linked into our tree
    pub fn is_known(&self, hash: &BlockHash) -> bool {
        self.find(hash)
            .map(|id| self.nodes[id.index()].is_known())
            .unwrap_or(false)
    }

    pub fn get(&self, id: NodeId) -> Option<&BlockIndexNode> {
        self.nodes.get(id.index())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut BlockIndexNode> {
        self.nodes.get_mut(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &BlockIndexNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (NodeId(idx as u32), node))
    }

    /// Returns the node for this hash, creating a placeholder if we've never seen it
    pub fn get_or_insert(&mut self, hash: BlockHash) -> NodeId {
        if let Some(id) = self.find(&hash) {
            return id;
        }

        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(BlockIndexNode::placeholder(hash));
        self.by_hash.insert(hash, id);

        id
    }

    /// Adds a header to the index, linking it to its parent
    ///
    /// The parent must be known already, unless this is a genesis block (a block whose parent is
    /// all zeros). Adding a header twice just returns the existing node.
    pub fn insert_header(&mut self, header: &Header) -> Result<NodeId, BlockStoreError> {
        let prev = match header.prev_blockhash == BlockHash::all_zeros() {
            true => None,
            false => Some(header.prev_blockhash),
        };

        let work = match prev.and_then(|hash| self.find(&hash)) {
            Some(prev_id) => self.nodes[prev_id.index()].chain_work + header.work(),
            None => header.work(),
        };

        self.insert_with_work(header.block_hash(), prev, work, Some(*header))
    }

    /// Like [BlockIndex::insert_header], but the total work is given, not computed
    pub fn insert_with_work(
        &mut self,
        hash: BlockHash,
        prev: Option<BlockHash>,
        chain_work: Work,
        header: Option<Header>,
    ) -> Result<NodeId, BlockStoreError> {
        if let Some(id) = self.find(&hash) {
            if self.nodes[id.index()].status.contains(BlockStatus::VALID_HEADER) {
                return Ok(id);
            }
        }

        let prev_id = match prev {
            Some(prev_hash) => {
                let prev_id = self.get_or_insert(prev_hash);
                if !self.nodes[prev_id.index()].status.contains(BlockStatus::VALID_HEADER) {
                    return Err(BlockStoreError::UnknownParent(prev_hash));
                }

                Some(prev_id)
            }
            None => None,
        };

        let id = self.get_or_insert(hash);
        let height = prev_id
            .map(|prev| self.nodes[prev.index()].height + 1)
            .unwrap_or(0);
        let skip = prev_id.and_then(|prev| self.get_ancestor(prev, skip_height(height)));
        let parent_failed = prev_id
            .map(|prev| self.nodes[prev.index()].status.is_failed())
            .unwrap_or(false);

        let node = &mut self.nodes[id.index()];
        node.prev = prev_id;
        node.height = height;
        node.chain_work = chain_work;
        node.skip = skip;
        node.header = header;
        node.status.insert(BlockStatus::VALID_HEADER);
        if parent_failed {
            node.status.insert(BlockStatus::FAILED_CHILD);
        }

        Ok(id)
    }

    /// Finds the ancestor of `id` at `height`
    pub fn get_ancestor(&self, id: NodeId, height: u32) -> Option<NodeId> {
        let mut walk = id;
        let mut walk_height = self.get(id)?.height;
        if height > walk_height {
            return None;
        }

        while walk_height > height {
            let node = &self.nodes[walk.index()];
            let jump = skip_height(walk_height);
            let jump_prev = skip_height(walk_height - 1);

            // only take the skip if it doesn't overshoot, and the parent's skip isn't better
            let take_skip = jump == height
                || (jump > height && !(jump_prev + 2 < jump && jump_prev >= height));

            match node.skip {
                Some(skip) if take_skip => {
                    walk = skip;
                    walk_height = jump;
                }
                _ => {
                    walk = node.prev?;
                    walk_height -= 1;
                }
            }
        }

        Some(walk)
    }

    /// Whether `ancestor` is `id` or one of its ancestors
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        match self.get(ancestor) {
            Some(node) => self.get_ancestor(id, node.height) == Some(ancestor),
            None => false,
        }
    }

    /// Marks a block as invalid, and every descendant we know of as a failed child
    pub fn mark_failed(&mut self, id: NodeId) {
        self.nodes[id.index()].status.insert(BlockStatus::FAILED_VALID);

        // parents first, so failures propagate all the way down
        let height = self.nodes[id.index()].height;
        let mut descendants: Vec<usize> = (0..self.nodes.len())
            .filter(|idx| self.nodes[*idx].is_known() && self.nodes[*idx].height > height)
            .collect();
        descendants.sort_by_key(|idx| self.nodes[*idx].height);

        for idx in descendants {
            let failed_parent = self.nodes[idx]
                .prev
                .map(|prev| self.nodes[prev.index()].status.is_failed())
                .unwrap_or(false);

            if failed_parent {
                self.nodes[idx].status.insert(BlockStatus::FAILED_CHILD);
            }
        }
    }

    /// What we persist for this node, `None` for placeholders
    pub fn to_disk(&self, id: NodeId) -> Option<DiskBlockIndex> {
        let node = self.get(id)?;
        Some(DiskBlockIndex {
            header: node.header?,
            height: node.height,
            status: node.status.bits(),
            tx_count: node.tx_count,
            data_pos: node.data_pos,
            undo_pos: node.undo_pos,
        })
    }

    /// Inserts a node we've just read from disk
    pub fn insert_from_disk(&mut self, record: &DiskBlockIndex) -> Result<NodeId, BlockStoreError> {
        let id = self.insert_header(&record.header)?;
        let node = &mut self.nodes[id.index()];
        node.status = BlockStatus::from_bits(record.status);
        node.status.insert(BlockStatus::VALID_HEADER);
        node.tx_count = record.tx_count;
        node.data_pos = record.data_pos;
        node.undo_pos = record.undo_pos;

        Ok(id)
    }
}

impl Index<NodeId> for BlockIndex {
    type Output = BlockIndexNode;

    fn index(&self, id: NodeId) -> &Self::Output {
        &self.nodes[id.index()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A block index node, as we keep it in the metadata database
///
/// Height is only here so we can insert nodes parents-first when loading, the rest of the
/// linkage comes from the header.
pub struct DiskBlockIndex {
    pub header: Header,
    pub height: u32,
    pub status: u32,
    pub tx_count: u32,
    pub data_pos: Option<DiskPosition>,
    pub undo_pos: Option<DiskPosition>,
}

fn encode_position<W: Write + ?Sized>(
    pos: &Option<DiskPosition>,
    writer: &mut W,
) -> bitcoin::io::Result<usize> {
    match pos {
        Some(pos) => Ok(1u8.consensus_encode(writer)? + pos.consensus_encode(writer)?),
        None => 0u8.consensus_encode(writer),
    }
}

fn decode_position<R: Read + ?Sized>(
    reader: &mut R,
) -> Result<Option<DiskPosition>, EncodeError> {
    match u8::consensus_decode(reader)? {
        0 => Ok(None),
        _ => Ok(Some(DiskPosition::consensus_decode(reader)?)),
    }
}

impl Encodable for DiskBlockIndex {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> bitcoin::io::Result<usize> {
        let mut len = self.header.consensus_encode(writer)?;
        len += self.height.consensus_encode(writer)?;
        len += self.status.consensus_encode(writer)?;
        len += self.tx_count.consensus_encode(writer)?;
        len += encode_position(&self.data_pos, writer)?;
        len += encode_position(&self.undo_pos, writer)?;
        Ok(len)
    }
}

impl Decodable for DiskBlockIndex {
    fn consensus_decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self, EncodeError> {
        Ok(DiskBlockIndex {
            header: Header::consensus_decode(reader)?,
            height: u32::consensus_decode(reader)?,
            status: u32::consensus_decode(reader)?,
            tx_count: u32::consensus_decode(reader)?,
            data_pos: decode_position(reader)?,
            undo_pos: decode_position(reader)?,
        })
    }
}

#[derive(Debug, Default, Clone)]
/// Every fork tip we know of, plus the chain with most work
pub struct HeaderChain {
    /// One node per fork, none of them is an ancestor of another
    tips: Vec<NodeId>,

    /// Our main chain, indexed by height
    chain: Vec<NodeId>,
}

impl HeaderChain {
    pub fn new() -> Self {
        HeaderChain::default()
    }

    pub fn tip(&self) -> Option<NodeId> {
        self.chain.last().copied()
    }

    pub fn height(&self) -> Option<u32> {
        self.chain.len().checked_sub(1).map(|height| height as u32)
    }

    pub fn tips(&self) -> &[NodeId] {
        &self.tips
    }

    /// The main chain block at `height`
    pub fn get(&self, height: u32) -> Option<NodeId> {
        self.chain.get(height as usize).copied()
    }

    /// Whether this node is part of our main chain
    pub fn contains(&self, index: &BlockIndex, id: NodeId) -> bool {
        index
            .get(id)
            .map(|node| self.get(node.height) == Some(id))
            .unwrap_or(false)
    }

    /// Makes `id` our main chain tip
    ///
    /// Only the part that differs from the current chain is touched.
    pub fn set_tip(&mut self, index: &BlockIndex, id: NodeId) {
        let mut path = Vec::new();
        let mut walk = Some(id);
        while let Some(current) = walk {
            let node = &index[current];
            if self.get(node.height) == Some(current) {
                break;
            }

            path.push(current);
            walk = node.prev;
        }

        let fork_len = walk.map(|fork| index[fork].height as usize + 1).unwrap_or(0);
        self.chain.truncate(fork_len);
        self.chain.extend(path.into_iter().rev());
    }

    /// Adds `id` to the tip set, unless it's already covered by some tip
    fn push_tip(&mut self, index: &BlockIndex, id: NodeId) {
        if self.tips.iter().any(|tip| index.is_ancestor(id, *tip)) {
            return;
        }

        self.tips.push(id);
    }

    /// Takes a header that was just added to (or updated in) the index, and updates our tips and
    /// main chain. Returns whether the main chain tip changed.
    ///
    /// # Panics
    ///
    /// If we're asked to mark a genesis block as invalid.
    pub fn append_header(&mut self, index: &BlockIndex, id: NodeId) -> bool {
        let node = &index[id];
        let valid = node.is_valid();
        assert!(valid || node.prev.is_some(), "genesis can't be invalid");

        let old_tip = self.tip();

        // does it extend one of our tips?
        let extended = self
            .tips
            .iter()
            .position(|tip| index.get_ancestor(id, index[*tip].height) == Some(*tip));

        let candidate = match extended {
            Some(position) => {
                let tip = self.tips.remove(position);
                let replacement = match valid {
                    true => id,
                    false => node.prev.unwrap_or(tip),
                };
                self.push_tip(index, replacement);

                if Some(tip) == old_tip {
                    self.set_tip(index, replacement);
                    if !valid {
                        // the parent may be covered by a fork with more work
                        self.adopt_best_tip(index);
                    }

                    return self.tip() != old_tip;
                }

                replacement
            }
            None => {
                // a header we already have, somewhere behind one of our tips
                let is_behind = |tip: &NodeId| index.get_ancestor(*tip, node.height) == Some(id);

                if self.tips.iter().any(is_behind) {
                    if valid {
                        return false;
                    }

                    let Some(parent) = node.prev else {
                        return false;
                    };
                    let main_chain = self.contains(index, id);

                    // every fork built on top of it goes back to its parent
                    self.tips.retain(|tip| !is_behind(tip));
                    self.push_tip(index, parent);
                    if main_chain {
                        self.set_tip(index, parent);
                        self.adopt_best_tip(index);
                    }

                    return self.tip() != old_tip;
                }

                if !valid {
                    return false;
                }

                self.push_tip(index, id);
                if self.chain.is_empty() {
                    info!("header chain starts at {}", node.hash);
                    self.set_tip(index, id);
                    return true;
                }

                id
            }
        };

        let best_work = old_tip.map(|tip| index[tip].chain_work);
        if best_work.map_or(true, |work| index[candidate].chain_work > work) {
            self.set_tip(index, candidate);
            return true;
        }

        false
    }

    /// Moves the main chain to the tip with most work, if there's one strictly better than the
    /// current one
    fn adopt_best_tip(&mut self, index: &BlockIndex) {
        let Some(current) = self.tip() else {
            return;
        };

        let mut best = current;
        for tip in self.tips.iter() {
            if index[*tip].is_valid() && index[*tip].chain_work > index[best].chain_work {
                best = *tip;
            }
        }

        if best != current {
            self.set_tip(index, best);
        }
    }
}
