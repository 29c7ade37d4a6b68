use std::mem::size_of;

use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};
use crate::layout::Layout;
use crate::volume::BlockNumber;

use super::block::{Block, BLOCK_SIZE, EMPTY_BLOCK};

/// The block holding the superblock.
pub const SUPERBLOCK_BLOCK_NUMBER: BlockNumber = 0;

/// The magic bytes at the very start of a formatted device.
pub const MAGIC: [u8; 4] = *b"WNFS";
/// [`MAGIC`] read as a big-endian integer.
pub const MAGIC_NUMBER: u32 = 0x574e4653;
const_assert!(u32::from_be_bytes(MAGIC) == MAGIC_NUMBER);

/// The number of bytes occupied by the superblock. The rest of block 0 is zero.
pub const SUPERBLOCK_SIZE: usize = 28;
const_assert!(size_of::<Superblock>() == SUPERBLOCK_SIZE);
const_assert!(SUPERBLOCK_SIZE <= BLOCK_SIZE);

/// The volume superblock.
///
/// The inode table always starts right after it, at block 1, so its position isn't stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct Superblock {
    /// Identifies the format, always [`MAGIC`].
    pub magic: [u8; 4],
    /// The number of inode slots, including the reserved inode 0.
    pub num_inodes: u32,
    /// The number of blocks in the volume.
    pub num_blocks: u32,
    /// First block of the inode bitmap.
    pub inode_bitmap_start: u32,
    /// First block of the block bitmap.
    pub block_bitmap_start: u32,
    /// First block of the bad-block bitmap.
    pub bad_block_bitmap_start: u32,
    /// First block of the data region.
    pub data_region_start: u32,
}

impl Superblock {
    /// Describes a volume laid out as `layout`.
    pub fn new(layout: &Layout) -> Self {
        Self {
            magic: MAGIC,
            num_inodes: layout.inode_count,
            num_blocks: layout.block_count,
            inode_bitmap_start: layout.inode_bitmap_start,
            block_bitmap_start: layout.block_bitmap_start,
            bad_block_bitmap_start: layout.bad_block_bitmap_start,
            data_region_start: layout.data_region_start,
        }
    }

    /// Decodes block 0. A magic mismatch is corruption: the device isn't one of ours.
    pub fn decode(block: &Block) -> Result<Self> {
        let superblock: Superblock = bincode::deserialize(&block[..SUPERBLOCK_SIZE])?;

        if superblock.magic != MAGIC {
            return Err(FsError::Corruption(format!(
                "bad superblock magic {:#010x}",
                u32::from_be_bytes(superblock.magic)
            )));
        }

        Ok(superblock)
    }

    pub fn encode(&self) -> Result<Block> {
        let serialized = bincode::serialize(self)?;

        let mut block = EMPTY_BLOCK;
        block[..SUPERBLOCK_SIZE].copy_from_slice(&serialized);

        Ok(block)
    }

    /// Re-derives the layout from the persisted counts and checks that the stored region starts
    /// agree with it.
    pub fn layout(&self) -> Result<Layout> {
        let layout = Layout::from_counts(self.num_inodes, self.num_blocks)?;

        let stored = [
            self.inode_bitmap_start,
            self.block_bitmap_start,
            self.bad_block_bitmap_start,
            self.data_region_start,
        ];
        let derived = [
            layout.inode_bitmap_start,
            layout.block_bitmap_start,
            layout.bad_block_bitmap_start,
            layout.data_region_start,
        ];

        if stored != derived {
            return Err(FsError::Corruption(format!(
                "superblock regions {stored:?} disagree with the layout {derived:?}"
            )));
        }

        Ok(layout)
    }
}
