mod util;

use std::path::Path;
use std::sync::Arc;

use bitcoin::consensus::serialize;
use floresta_blockstore::spawn_block_importer;
use floresta_blockstore::BlockStore;
use floresta_blockstore::DiskPosition;
use floresta_blockstore::Importer;
use floresta_blockstore::IndexingAcceptor;
use floresta_blockstore::MemoryMetadataStore;
use spin::RwLock;
use util::chain;
use util::child_of;
use util::framed;
use util::test_config;

#[test]
fn test_reindex_finds_everything_again() {
    let config = test_config();
    let blocks = chain(10);

    let positions = {
        let store = Arc::new(BlockStore::new(config.clone(), MemoryMetadataStore::new()).unwrap());
        store.init_genesis().unwrap();

        let acceptor = IndexingAcceptor::new(store.clone());
        let importer = Importer::new(&store, &acceptor, Arc::new(RwLock::new(false)));
        let refs = blocks.iter().collect::<Vec<_>>();
        let stats = importer.import_source(&framed(&refs), None);
        assert_eq!(stats.loaded, 9);
        assert_eq!(stats.duplicates, 1);
        store.flush().unwrap();

        blocks
            .iter()
            .map(|block| store.block_position(&block.block_hash()).unwrap())
            .collect::<Vec<_>>()
    };

    // all metadata is gone, only the block files are left
    let mut config = config;
    config.reindex = true;
    let store = Arc::new(BlockStore::new(config, MemoryMetadataStore::new()).unwrap());
    assert!(store.is_reindexing());

    let acceptor = IndexingAcceptor::new(store.clone());
    let importer = Importer::new(&store, &acceptor, Arc::new(RwLock::new(false)));
    let stats = importer.reindex().unwrap();

    assert_eq!(stats.loaded, 10);
    assert_eq!(stats.orphaned, 0);
    assert!(!store.is_reindexing());
    assert_eq!(store.header_chain_tip(), Some((blocks[9].block_hash(), 9)));

    for (block, pos) in blocks.iter().zip(positions.iter()) {
        assert_eq!(store.block_position(&block.block_hash()), Some(*pos));
    }

    // nothing was rewritten, and new blocks go after the old ones
    let last = positions.last().unwrap();
    let next = child_of(&blocks[9], 10);
    let (_, pos) = store.write_block(10, &serialize(&next)).unwrap();
    assert_eq!(
        pos,
        DiskPosition::new(0, last.byte_offset + util::CHILD_SIZE + 8)
    );
}

#[test]
fn test_reindex_with_parents_in_later_files() {
    let mut config = test_config();
    config.reindex = true;
    let blocks = chain(4);

    // blocks 2 and 3 made it to disk before block 1
    let blocks_dir = config.blocks_dir();
    std::fs::create_dir_all(&blocks_dir).unwrap();
    std::fs::write(
        blocks_dir.join("blk00000.dat"),
        framed(&[&blocks[0], &blocks[3], &blocks[2]]),
    )
    .unwrap();
    std::fs::write(blocks_dir.join("blk00001.dat"), framed(&[&blocks[1]])).unwrap();

    let store = Arc::new(BlockStore::new(config, MemoryMetadataStore::new()).unwrap());
    let acceptor = IndexingAcceptor::new(store.clone());
    let importer = Importer::new(&store, &acceptor, Arc::new(RwLock::new(false)));
    let stats = importer.reindex().unwrap();

    assert_eq!(stats.sources, 2);
    assert_eq!(stats.loaded, 4);
    assert_eq!(stats.orphaned, 0);
    assert_eq!(importer.pending_count(), 0);
    assert_eq!(store.header_chain_tip(), Some((blocks[3].block_hash(), 3)));

    // the children were found where they already were
    let first = util::GENESIS_SIZE + 8;
    assert_eq!(
        store.block_position(&blocks[3].block_hash()),
        Some(DiskPosition::new(0, first + 8))
    );
    assert_eq!(
        store.block_position(&blocks[2].block_hash()),
        Some(DiskPosition::new(0, first + util::CHILD_SIZE + 16))
    );
    assert_eq!(
        store.block_position(&blocks[1].block_hash()),
        Some(DiskPosition::new(1, 8))
    );
}

#[test]
fn test_reindex_counts_blocks_without_parent() {
    let mut config = test_config();
    config.reindex = true;
    let blocks = chain(4);

    // block 1 is nowhere
    let blocks_dir = config.blocks_dir();
    std::fs::create_dir_all(&blocks_dir).unwrap();
    std::fs::write(
        blocks_dir.join("blk00000.dat"),
        framed(&[&blocks[0], &blocks[3], &blocks[2]]),
    )
    .unwrap();

    let store = Arc::new(BlockStore::new(config, MemoryMetadataStore::new()).unwrap());
    let acceptor = IndexingAcceptor::new(store.clone());
    let importer = Importer::new(&store, &acceptor, Arc::new(RwLock::new(false)));
    let stats = importer.reindex().unwrap();

    assert_eq!(stats.loaded, 1);
    assert_eq!(stats.orphaned, 2);
    assert_eq!(importer.pending_count(), 0);
    assert_eq!(store.header_chain_tip(), Some((blocks[0].block_hash(), 0)));
}

#[test]
fn test_forks_from_a_source() {
    let store = Arc::new(BlockStore::new(test_config(), MemoryMetadataStore::new()).unwrap());
    let acceptor = IndexingAcceptor::new(store.clone());
    let importer = Importer::new(&store, &acceptor, Arc::new(RwLock::new(false)));

    let blocks = chain(3);
    let fork_a = child_of(&blocks[2], 100);
    let fork_b = child_of(&blocks[2], 101);
    let fork_b2 = child_of(&fork_b, 102);

    // the longer fork comes first, and before its parent
    let stats = importer.import_source(
        &framed(&[
            &fork_b2, &blocks[0], &blocks[1], &blocks[2], &fork_a, &fork_b,
        ]),
        None,
    );
    assert_eq!(stats.loaded, 6);

    assert_eq!(store.header_chain_tip(), Some((fork_b2.block_hash(), 4)));
    assert_eq!(store.block_hash_at(3), Some(fork_b.block_hash()));

    let mut tips = store.header_chain_tips();
    tips.sort();
    let mut expected = vec![fork_a.block_hash(), fork_b2.block_hash()];
    expected.sort();
    assert_eq!(tips, expected);
}

#[test]
fn test_block_importer_thread() {
    let mut config = test_config();
    let blocks = chain(6);

    std::fs::create_dir_all(&config.data_dir).unwrap();
    let bootstrap = Path::new(&config.data_dir).join("bootstrap.dat");
    std::fs::write(&bootstrap, framed(&[&blocks[0], &blocks[1], &blocks[2]])).unwrap();

    let extra = Path::new(&config.data_dir).join("more-blocks.dat");
    std::fs::write(&extra, framed(&[&blocks[5], &blocks[4], &blocks[3]])).unwrap();

    config.load_block = vec![
        extra.to_string_lossy().into_owned(),
        format!("{}/missing.dat", config.data_dir),
    ];
    config.stop_after_import = true;

    let store = Arc::new(BlockStore::new(config, MemoryMetadataStore::new()).unwrap());
    let acceptor = Arc::new(IndexingAcceptor::new(store.clone()));
    let shutdown = Arc::new(RwLock::new(false));

    let handle = spawn_block_importer(store.clone(), acceptor, shutdown.clone()).unwrap();
    let stats = handle.join().unwrap().unwrap();

    assert_eq!(stats.sources, 2);
    assert_eq!(stats.loaded, 6);
    assert_eq!(store.header_chain_tip(), Some((blocks[5].block_hash(), 5)));
    assert!(*shutdown.read());

    // bootstrap.dat is only imported once
    assert!(!bootstrap.exists());
    assert!(bootstrap.with_extension("dat.old").exists());
}
