mod util;

use std::sync::Arc;

use bitcoin::consensus::serialize;
use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use floresta_blockstore::BlockStore;
use floresta_blockstore::BlockStoreError;
use floresta_blockstore::DiskPosition;
use floresta_blockstore::MemoryMetadataStore;
use floresta_blockstore::RawBlock;
use floresta_blockstore::StorageKind;
use util::chain;
use util::test_config;
use util::CHILD_SIZE;
use util::GENESIS_SIZE;

#[test]
fn test_blocks_are_appended_back_to_back() {
    let store = BlockStore::new(test_config(), MemoryMetadataStore::new()).unwrap();
    assert!(store.init_genesis().unwrap());

    let blocks = chain(3);
    let (_, first) = store.write_block(1, &serialize(&blocks[1])).unwrap();
    let (_, second) = store.write_block(2, &serialize(&blocks[2])).unwrap();

    assert_eq!(first, DiskPosition::new(0, 8 + GENESIS_SIZE + 8));
    assert_eq!(second, DiskPosition::new(0, first.byte_offset + CHILD_SIZE + 8));

    let block = store.load_block(second).unwrap();
    let raw = RawBlock::new(&block).unwrap();
    assert_eq!(raw.block_hash(), blocks[2].block_hash());
    assert_eq!(raw.to_block().unwrap(), blocks[2]);

    let info = store.writer().file_info(0).unwrap().unwrap();
    assert_eq!(info.blocks, 3);
    assert_eq!(info.height_first, 0);
    assert_eq!(info.height_last, 2);
    assert_eq!(info.size, second.byte_offset + CHILD_SIZE);
}

#[test]
fn test_reads_share_the_mapping() {
    let store = BlockStore::new(test_config(), MemoryMetadataStore::new()).unwrap();
    store.init_genesis().unwrap();

    let blocks = chain(2);
    let (_, pos) = store.write_block(1, &serialize(&blocks[1])).unwrap();

    let (whole, len) = store.files().map(StorageKind::BlockData, 0).unwrap();
    let block = store.load_block(pos).unwrap();
    assert_eq!(whole.mapped_len(), len);
    assert_eq!(block.mapped_len(), len);
    assert_eq!(block.file_offset(), pos.byte_offset as usize);
    assert_eq!(
        &whole[pos.byte_offset as usize..(pos.byte_offset + CHILD_SIZE) as usize],
        &block[..]
    );
}

#[test]
fn test_bad_positions() {
    let store = BlockStore::new(test_config(), MemoryMetadataStore::new()).unwrap();
    store.init_genesis().unwrap();

    assert!(matches!(
        store.load_block(DiskPosition::new(0, 2)),
        Err(BlockStoreError::PositionTooSmall(_))
    ));
    assert!(matches!(
        store.load_block(DiskPosition::new(0, u32::MAX)),
        Err(BlockStoreError::PositionOutOfFile { .. })
    ));
    assert!(store.load_block(DiskPosition::new(9, 8)).is_err());
}

#[test]
fn test_undo_data_checks_parent() {
    let store = BlockStore::new(test_config(), MemoryMetadataStore::new()).unwrap();
    store.init_genesis().unwrap();

    let blocks = chain(3);
    let (_, first) = store
        .write_undo_block(&[1; 40], &blocks[0].block_hash(), 0)
        .unwrap();
    let (_, second) = store
        .write_undo_block(&[2; 10], &blocks[1].block_hash(), 0)
        .unwrap();

    // the frame, the payload and a 32-byte checksum
    assert_eq!(first, DiskPosition::new(0, 8));
    assert_eq!(second, DiskPosition::new(0, 8 + 40 + 32 + 8));

    assert_eq!(
        &store.load_undo_block(second, &blocks[1].block_hash()).unwrap()[..],
        &[2; 10]
    );

    let err = store
        .load_undo_block(first, &BlockHash::all_zeros())
        .unwrap_err();
    assert!(matches!(err, BlockStoreError::ChecksumMismatch(_)));
}

#[test]
fn test_concurrent_readers() {
    let store = Arc::new(BlockStore::new(test_config(), MemoryMetadataStore::new()).unwrap());
    store.init_genesis().unwrap();

    let blocks = chain(20);
    let mut positions = Vec::new();
    for (height, block) in blocks.iter().enumerate().skip(1) {
        let (_, pos) = store.write_block(height as u32, &serialize(block)).unwrap();
        positions.push((pos, block.block_hash()));
    }

    let readers = (0..4)
        .map(|_| {
            let store = store.clone();
            let positions = positions.clone();
            std::thread::spawn(move || {
                for (pos, hash) in positions {
                    let block = store.load_block(pos).unwrap();
                    assert_eq!(RawBlock::new(&block).unwrap().block_hash(), hash);
                }
            })
        })
        .collect::<Vec<_>>();

    for reader in readers {
        reader.join().unwrap();
    }
}

#[cfg(feature = "kv-store")]
#[test]
fn test_metadata_survives_restart() {
    use floresta_blockstore::NodeId;

    let config = test_config();
    let blocks = chain(4);

    let (tip, positions) = {
        let store = BlockStore::open_kv(config.clone()).unwrap();
        store.init_genesis().unwrap();

        let mut positions = Vec::new();
        for (height, block) in blocks.iter().enumerate().skip(1) {
            let (id, _) = store.accept_header(&block.header).unwrap();
            let (_, pos) = store.write_block(height as u32, &serialize(block)).unwrap();
            store.write_index(|inner| {
                let node = inner.index.get_mut(id).unwrap();
                node.data_pos = Some(pos);
                node.tx_count = 1;
                inner.mark_dirty(id);
            });
            positions.push(pos);
        }

        store.write_flag("txindex", true).unwrap();
        store.flush().unwrap();
        (store.header_chain_tip().unwrap(), positions)
    };

    let store = BlockStore::open_kv(config).unwrap();
    assert_eq!(store.header_chain_tip(), None);

    store.cache_all_block_infos().unwrap();
    assert_eq!(store.header_chain_tip(), Some(tip));
    assert_eq!(tip, (blocks[3].block_hash(), 3));
    assert_eq!(store.read_flag("txindex").unwrap(), Some(true));

    for (block, pos) in blocks.iter().skip(1).zip(positions.iter()) {
        assert_eq!(store.block_position(&block.block_hash()), Some(*pos));
        assert_eq!(&store.load_block(*pos).unwrap()[..], &serialize(block)[..]);
    }

    // new blocks go right after the last one we had
    let next = util::child_of(&blocks[3], 4);
    let (_, pos) = store.write_block(4, &serialize(&next)).unwrap();
    let last = positions.last().unwrap();
    assert_eq!(pos, DiskPosition::new(0, last.byte_offset + util::CHILD_SIZE + 8));

    let ids: Vec<NodeId> = store.read_index(|index, _| index.iter().map(|(id, _)| id).collect());
    assert_eq!(ids.len(), 4);
}
