//! Configuration for the block store.
//!
//! This crate doesn't parse command line arguments, whoever embeds us fills a [BlockStoreConfig]
//! and hands it over. Optionally, some knobs may come from a toml file, see [ConfigFile].
use std::path::PathBuf;

use bitcoin::Network;
use serde::Deserialize;

use crate::disk::StorageKind;
use crate::error::BlockStoreError;

/// The maximum size of a block file, we start a new one after this
pub const MAX_BLOCKFILE_SIZE: u32 = 0x8000000; // 128 MiB

/// Block files are grown in chunks of this size
pub const BLOCKFILE_CHUNK_SIZE: u32 = 0x1000000; // 16 MiB

/// Undo files are grown in chunks of this size
pub const UNDOFILE_CHUNK_SIZE: u32 = 0x100000; // 1 MiB

/// Default cache size for the metadata database, in MiB
pub const DEFAULT_CACHE_SIZE: usize = 300;

/// Smallest cache we'll ever ask for, in MiB
pub const MIN_CACHE_SIZE: usize = 4;

/// Biggest cache we'll ever ask for, in MiB. Keep it small on 32-bit targets
#[cfg(target_pointer_width = "32")]
pub const MAX_CACHE_SIZE: usize = 1024;
#[cfg(not(target_pointer_width = "32"))]
pub const MAX_CACHE_SIZE: usize = 16384;

#[derive(Debug, Clone)]
pub struct BlockStoreConfig {
    /// Where we keep our data
    ///
    /// Block files go into `{data_dir}/blocks/`, the metadata database into
    /// `{data_dir}/blocks/index/`.
    pub data_dir: String,

    /// Which network we are on. This decides the magic bytes in front of every record
    pub network: Network,

    /// The maximum size of a block file, in bytes
    ///
    /// Once appending a block would make the current file bigger than this, we start a new
    /// file. Undo files are never rotated by size, they follow their block file.
    pub max_blockfile_size: Option<u32>,

    /// How much we grow a block file each time it runs out of space
    pub blockfile_chunk_size: Option<u32>,

    /// How much we grow an undo file each time it runs out of space
    pub undofile_chunk_size: Option<u32>,

    /// Extra directories where we look for block files we don't have
    ///
    /// Those are only used for reading, and only if they have a `blocks` subdirectory.
    pub block_data_dirs: Vec<String>,

    /// Throw away the metadata database when opening the store
    pub wipe: bool,

    /// Cache size for the metadata database, in MiB
    pub cache_size: Option<usize>,

    /// Rebuild the index from our block files
    pub reindex: bool,

    /// External block files to import after startup
    pub load_block: Vec<String>,

    /// Ask the node to stop once all imports are done
    pub stop_after_import: bool,
}

impl BlockStoreConfig {
    /// Creates a new configuration for mainnet
    ///
    /// Sizes are left unset, so a config file may still fill them. Unset sizes fall back to
    /// the defaults above.
    pub fn new(data_dir: String) -> Self {
        BlockStoreConfig {
            data_dir,
            network: Network::Bitcoin,
            max_blockfile_size: None,
            blockfile_chunk_size: None,
            undofile_chunk_size: None,
            block_data_dirs: Vec::new(),
            wipe: false,
            cache_size: None,
            reindex: false,
            load_block: Vec::new(),
            stop_after_import: false,
        }
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    /// Fills every knob we don't have yet with what's inside the file
    ///
    /// Anything already set here wins over the file.
    pub fn merge_file(&mut self, file: ConfigFile) {
        let file = file.blockstore;

        if self.max_blockfile_size.is_none() {
            self.max_blockfile_size = file.max_blockfile_size;
        }
        if self.blockfile_chunk_size.is_none() {
            self.blockfile_chunk_size = file.blockfile_chunk_size;
        }
        if self.undofile_chunk_size.is_none() {
            self.undofile_chunk_size = file.undofile_chunk_size;
        }
        if self.cache_size.is_none() {
            self.cache_size = file.cache_size;
        }
        if self.block_data_dirs.is_empty() {
            self.block_data_dirs = file.block_data_dirs.unwrap_or_default();
        }
        if self.load_block.is_empty() {
            self.load_block = file.load_block.unwrap_or_default();
        }

        self.wipe |= file.wipe.unwrap_or(false);
        self.reindex |= file.reindex.unwrap_or(false);
        self.stop_after_import |= file.stop_after_import.unwrap_or(false);
    }

    pub fn max_blockfile_size(&self) -> u32 {
        self.max_blockfile_size.unwrap_or(MAX_BLOCKFILE_SIZE)
    }

    /// The growth chunk for files of this kind
    pub fn chunk_size(&self, kind: StorageKind) -> u32 {
        match kind {
            StorageKind::BlockData => self.blockfile_chunk_size.unwrap_or(BLOCKFILE_CHUNK_SIZE),
            StorageKind::UndoData => self.undofile_chunk_size.unwrap_or(UNDOFILE_CHUNK_SIZE),
        }
    }

    /// Cache size for the metadata database, in bytes, clamped to something sane
    pub fn cache_size_bytes(&self) -> u64 {
        let mib = self
            .cache_size
            .unwrap_or(DEFAULT_CACHE_SIZE)
            .clamp(MIN_CACHE_SIZE, MAX_CACHE_SIZE);

        (mib as u64) << 20
    }

    /// The directory holding our own block files
    pub fn blocks_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("blocks")
    }

    /// The directory holding our metadata database
    pub fn index_dir(&self) -> PathBuf {
        self.blocks_dir().join("index")
    }
}

#[derive(Default, Debug, Deserialize)]
pub struct BlockStoreSection {
    pub max_blockfile_size: Option<u32>,
    pub blockfile_chunk_size: Option<u32>,
    pub undofile_chunk_size: Option<u32>,
    pub block_data_dirs: Option<Vec<String>>,
    pub wipe: Option<bool>,
    pub cache_size: Option<usize>,
    pub reindex: Option<bool>,
    pub load_block: Option<Vec<String>>,
    pub stop_after_import: Option<bool>,
}

#[derive(Default, Debug, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub blockstore: BlockStoreSection,
}

impl ConfigFile {
    pub fn from_file(filename: &str) -> Result<Self, BlockStoreError> {
        let file = std::fs::read_to_string(filename)?;
        Self::from_toml(&file)
    }

    pub fn from_toml(contents: &str) -> Result<Self, BlockStoreError> {
        Ok(toml::from_str(contents)?)
    }
}
