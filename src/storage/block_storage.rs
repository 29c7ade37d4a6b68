use crate::disk_format::block::Block;
use crate::error::Result;
use crate::volume::BlockNumber;

/// Fixed-size block reads and writes by absolute block number.
///
/// Implementations serialize physical access themselves; the engine may call in from several
/// threads.
pub trait BlockStorage {
    fn read_block(&self, block_number: BlockNumber) -> Result<Block>;

    fn write_block(&self, block_number: BlockNumber, block: &Block) -> Result<()>;

    /// The capacity of the device in blocks.
    fn num_blocks(&self) -> Result<usize>;

    /// Pushes written blocks down to stable storage.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl<T: BlockStorage + ?Sized> BlockStorage for &T {
    fn read_block(&self, block_number: BlockNumber) -> Result<Block> {
        (**self).read_block(block_number)
    }

    fn write_block(&self, block_number: BlockNumber, block: &Block) -> Result<()> {
        (**self).write_block(block_number, block)
    }

    fn num_blocks(&self) -> Result<usize> {
        (**self).num_blocks()
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}
