#![allow(dead_code)]

use bitcoin::absolute::LockTime;
use bitcoin::block::Header;
use bitcoin::block::Version;
use bitcoin::consensus::serialize;
use bitcoin::constants::genesis_block;
use bitcoin::hashes::Hash;
use bitcoin::params::Params;
use bitcoin::transaction;
use bitcoin::Amount;
use bitcoin::Block;
use bitcoin::Network;
use bitcoin::OutPoint;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxMerkleNode;
use bitcoin::TxOut;
use bitcoin::Witness;
use floresta_blockstore::BlockStoreConfig;

/// Size of a serialized [child_of] block: the header, one byte for the tx count and a 62-byte
/// coinbase
pub const CHILD_SIZE: u32 = 143;

/// Size of the regtest genesis block
pub const GENESIS_SIZE: u32 = 285;

pub fn test_config() -> BlockStoreConfig {
    let dir = format!("./tmp-db/{}", rand::random::<u64>());
    BlockStoreConfig::new(dir).with_network(Network::Regtest)
}

/// A block on top of `parent` with a single coinbase. `tag` makes siblings different
pub fn child_of(parent: &Block, tag: u8) -> Block {
    let coinbase = Transaction {
        version: transaction::Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(vec![tag, 0x51]),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(5_000_000_000),
            script_pubkey: ScriptBuf::new(),
        }],
    };

    Block {
        header: Header {
            version: Version::ONE,
            prev_blockhash: parent.block_hash(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: parent.header.time + 600,
            bits: parent.header.bits,
            nonce: tag as u32,
        },
        txdata: vec![coinbase],
    }
}

/// Regtest genesis and `len - 1` blocks on top of it
pub fn chain(len: usize) -> Vec<Block> {
    let mut blocks = vec![genesis_block(Params::new(Network::Regtest))];
    for i in 1..len {
        let block = child_of(&blocks[i - 1], i as u8);
        blocks.push(block);
    }

    blocks
}

/// Frames `blocks` the way they'd be in a block file
pub fn framed(blocks: &[&Block]) -> Vec<u8> {
    let magic = Network::Regtest.magic().to_bytes();
    let mut buf = Vec::new();
    for block in blocks {
        let bytes = serialize(*block);
        buf.extend_from_slice(&magic);
        buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&bytes);
    }

    buf
}
