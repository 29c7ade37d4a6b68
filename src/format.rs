//! Laying down an empty volume.

use log::info;

use crate::bitmap::BitmapAllocator;
use crate::disk_format::inode::{InodeType, NULL_INODE, ROOT_INODE};
use crate::disk_format::superblock::{Superblock, SUPERBLOCK_BLOCK_NUMBER};
use crate::error::{FsError, Result, Resource};
use crate::inode_store::InodeStore;
use crate::layout::{Layout, DEFAULT_INODE_RATIO};
use crate::resolver::BlockAddressResolver;
use crate::storage::{BlockStorage, BufferCache};
use crate::volume::BlockNumber;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatOptions {
    /// Bytes of device capacity per inode.
    pub inode_ratio: u64,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            inode_ratio: DEFAULT_INODE_RATIO,
        }
    }
}

/// Writes an empty filesystem over the whole of `storage`: the superblock, zeroed bitmaps with
/// the metadata blocks and inode 0 marked used, and a root directory (inode 1) owning a single
/// empty directory block.
pub fn format<S: BlockStorage>(storage: S, options: &FormatOptions) -> Result<Superblock> {
    let device_blocks = storage.num_blocks()?;
    let layout = Layout::plan(device_blocks as u64, options.inode_ratio)?;
    let superblock = Superblock::new(&layout);

    let cache = BufferCache::with_limit(storage, layout.block_count as BlockNumber);
    let data_start = layout.data_region_start as BlockNumber;

    for block_number in 0..data_start {
        cache.zeroed(block_number)?;
    }
    cache.write(SUPERBLOCK_BLOCK_NUMBER, &superblock.encode()?)?;

    let inodes = InodeStore::new(&layout);
    inodes.bitmap().reserve(&cache, NULL_INODE as usize)?;

    let blocks = BitmapAllocator::new(
        Resource::Blocks,
        layout.block_bitmap_start as BlockNumber,
        layout.block_count as usize,
    );
    for block_number in 0..data_start {
        blocks.reserve(&cache, block_number)?;
    }

    let (root_inum, mut root) = inodes.allocate_new(&cache, InodeType::Directory)?;
    if root_inum != ROOT_INODE {
        return Err(FsError::Corruption(format!(
            "root directory was allocated inode {root_inum}"
        )));
    }

    BlockAddressResolver::new(&cache, &blocks, data_start).grow(&mut root, 0)?;
    inodes.store(&cache, ROOT_INODE, &root)?;

    cache.sync()?;

    info!(
        "formatted {} blocks: {} inodes, inode table at {}..{}, data from block {}",
        layout.block_count,
        layout.inode_count,
        layout.inode_table_start,
        layout.inode_bitmap_start,
        layout.data_region_start,
    );

    Ok(superblock)
}
