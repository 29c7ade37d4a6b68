use std::mem::size_of;

/// size of a block in bytes
pub const BLOCK_SIZE: usize = 4096;

pub type Block = [u8; BLOCK_SIZE];
const_assert!(size_of::<Block>() == BLOCK_SIZE);

/// The number of units one block of a bitmap region tracks.
pub const BITS_PER_BLOCK: usize = BLOCK_SIZE * 8;

pub const EMPTY_BLOCK: Block = [0; BLOCK_SIZE];

/// The number of blocks needed to hold `bits` bits of a bitmap.
pub const fn bitmap_blocks(bits: usize) -> usize {
    bits.div_ceil(BITS_PER_BLOCK)
}
