//! Placement of the metadata regions on a volume.
//!
//! ```text
//! | superblock | inode table | inode bitmap | block bitmap | bad-block bitmap | data ... |
//! 0            1
//! ```

use crate::disk_format::block::{bitmap_blocks, BLOCK_SIZE};
use crate::disk_format::inode::INODE_SIZE;
use crate::error::{FsError, Result};

/// The inode table always directly follows the superblock.
pub const INODE_TABLE_START: u32 = 1;

/// Bytes of device capacity per inode when formatting.
pub const DEFAULT_INODE_RATIO: u64 = 1 << 15;

/// Absolute block indices of every region of a volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    /// The number of inode slots, including the reserved inode 0.
    pub inode_count: u32,
    pub block_count: u32,
    pub inode_table_start: u32,
    pub inode_bitmap_start: u32,
    pub block_bitmap_start: u32,
    pub bad_block_bitmap_start: u32,
    pub data_region_start: u32,
}

impl Layout {
    /// Plans a volume for a device of `device_blocks` blocks with one inode per `inode_ratio`
    /// bytes of capacity.
    pub fn plan(device_blocks: u64, inode_ratio: u64) -> Result<Layout> {
        if device_blocks == 0 {
            return Err(FsError::InvalidGeometry("zero-size device".into()));
        }

        if inode_ratio == 0 {
            return Err(FsError::InvalidGeometry("inode ratio must be positive".into()));
        }

        let block_count = u32::try_from(device_blocks).map_err(|_| {
            FsError::InvalidGeometry(format!("{device_blocks} blocks exceed 32-bit addressing"))
        })?;

        let device_bytes = device_blocks * BLOCK_SIZE as u64;
        let inode_count = u32::try_from(device_bytes / inode_ratio).map_err(|_| {
            FsError::InvalidGeometry(format!("inode ratio {inode_ratio} yields too many inodes"))
        })?;

        Self::from_counts(inode_count, block_count)
    }

    /// Derives the layout from the counts persisted in a superblock. Formatting and mounting
    /// both go through here so they can't disagree.
    pub fn from_counts(inode_count: u32, block_count: u32) -> Result<Layout> {
        if inode_count < 2 {
            // we need at least the null inode and the root
            return Err(FsError::InvalidGeometry(format!(
                "invalid number of inodes: {inode_count}"
            )));
        }

        let inode_table_blocks =
            (inode_count as u64 * INODE_SIZE as u64).div_ceil(BLOCK_SIZE as u64);
        let inode_bitmap_blocks = bitmap_blocks(inode_count as usize) as u64;
        let block_bitmap_blocks = bitmap_blocks(block_count as usize) as u64;

        let inode_table_start = INODE_TABLE_START as u64;
        let inode_bitmap_start = inode_table_start + inode_table_blocks;
        let block_bitmap_start = inode_bitmap_start + inode_bitmap_blocks;
        let bad_block_bitmap_start = block_bitmap_start + block_bitmap_blocks;
        let data_region_start = bad_block_bitmap_start + block_bitmap_blocks;

        // the root directory needs at least one data block
        if data_region_start >= block_count as u64 {
            return Err(FsError::InvalidGeometry(format!(
                "device too small: metadata needs {data_region_start} of {block_count} blocks"
            )));
        }

        Ok(Layout {
            inode_count,
            block_count,
            inode_table_start: INODE_TABLE_START,
            inode_bitmap_start: inode_bitmap_start as u32,
            block_bitmap_start: block_bitmap_start as u32,
            bad_block_bitmap_start: bad_block_bitmap_start as u32,
            data_region_start: data_region_start as u32,
        })
    }

    pub fn inode_table_blocks(&self) -> u32 {
        self.inode_bitmap_start - self.inode_table_start
    }

    /// The number of blocks available for file data.
    pub fn data_blocks(&self) -> u32 {
        self.block_count - self.data_region_start
    }
}
