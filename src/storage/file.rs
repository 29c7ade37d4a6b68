use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::unix::prelude::FileExt;

use crate::disk_format::block::{Block, BLOCK_SIZE};
use crate::error::{FsError, Result};
use crate::volume::BlockNumber;

use super::block_storage::BlockStorage;

/// Storage backed by a block device or a regular image file.
pub struct FileBackedStorage(File);

impl FileBackedStorage {
    pub fn new(file: File) -> Self {
        FileBackedStorage(file)
    }

    fn check_bounds(&self, block_number: BlockNumber) -> Result<()> {
        let num_blocks = self.num_blocks()?;

        if block_number >= num_blocks {
            return Err(FsError::InvalidIndex {
                what: "device block",
                index: block_number as u64,
                limit: num_blocks as u64,
            });
        }

        Ok(())
    }
}

impl BlockStorage for FileBackedStorage {
    fn read_block(&self, block_number: BlockNumber) -> Result<Block> {
        self.check_bounds(block_number)?;

        let mut buf = [0; BLOCK_SIZE];
        let position = block_number * BLOCK_SIZE;

        self.0.read_exact_at(&mut buf, position as u64)?;

        Ok(buf)
    }

    fn write_block(&self, block_number: BlockNumber, block: &Block) -> Result<()> {
        self.check_bounds(block_number)?;

        let position = block_number * BLOCK_SIZE;
        self.0.write_all_at(block, position as u64)?;

        Ok(())
    }

    fn num_blocks(&self) -> Result<usize> {
        // block devices report a zero length in their metadata, but seeking to the end works
        // for both them and regular files
        let len = (&self.0).seek(SeekFrom::End(0))?;

        Ok(len as usize / BLOCK_SIZE)
    }

    fn flush(&self) -> Result<()> {
        self.0.sync_data()?;

        Ok(())
    }
}
