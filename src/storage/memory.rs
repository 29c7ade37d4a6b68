use std::sync::{Mutex, PoisonError};

use crate::disk_format::block::{Block, EMPTY_BLOCK};
use crate::error::{FsError, Result};
use crate::volume::BlockNumber;

use super::block_storage::BlockStorage;

/// Storage held entirely in memory.
pub struct MemoryStorage {
    blocks: Mutex<Vec<Block>>,
}

impl MemoryStorage {
    /// A zero-filled device of `num_blocks` blocks.
    pub fn new(num_blocks: usize) -> Self {
        Self {
            blocks: Mutex::new(vec![EMPTY_BLOCK; num_blocks]),
        }
    }

    fn out_of_bounds(block_number: BlockNumber, num_blocks: usize) -> FsError {
        FsError::InvalidIndex {
            what: "device block",
            index: block_number as u64,
            limit: num_blocks as u64,
        }
    }
}

impl BlockStorage for MemoryStorage {
    fn read_block(&self, block_number: BlockNumber) -> Result<Block> {
        let blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);

        blocks
            .get(block_number)
            .copied()
            .ok_or_else(|| Self::out_of_bounds(block_number, blocks.len()))
    }

    fn write_block(&self, block_number: BlockNumber, block: &Block) -> Result<()> {
        let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        let num_blocks = blocks.len();

        let target = blocks
            .get_mut(block_number)
            .ok_or_else(|| Self::out_of_bounds(block_number, num_blocks))?;
        target.copy_from_slice(block);

        Ok(())
    }

    fn num_blocks(&self) -> Result<usize> {
        Ok(self.blocks.lock().unwrap_or_else(PoisonError::into_inner).len())
    }
}
