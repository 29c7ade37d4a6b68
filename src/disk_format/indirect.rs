use super::block::BLOCK_SIZE;
use super::inode::{POINTERS_PER_BLOCK, POINTER_SIZE};

const_assert!(POINTERS_PER_BLOCK * POINTER_SIZE == BLOCK_SIZE);

/// A view of a block as a flat array of little-endian `u32` block pointers. Zero means "no
/// block".
pub struct IndirectBlock<B>(B);

impl<B: AsRef<[u8]>> IndirectBlock<B> {
    pub fn new(block: B) -> Self {
        IndirectBlock(block)
    }

    pub fn get(&self, index: usize) -> u32 {
        let start = index * POINTER_SIZE;
        let mut bytes = [0; POINTER_SIZE];
        bytes.copy_from_slice(&self.0.as_ref()[start..start + POINTER_SIZE]);

        u32::from_le_bytes(bytes)
    }

    /// The non-zero pointers, in order.
    pub fn pointers(&self) -> Vec<u32> {
        (0..POINTERS_PER_BLOCK)
            .map(|index| self.get(index))
            .filter(|pointer| *pointer != 0)
            .collect()
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> IndirectBlock<B> {
    pub fn set(&mut self, index: usize, pointer: u32) {
        let start = index * POINTER_SIZE;
        self.0.as_mut()[start..start + POINTER_SIZE].copy_from_slice(&pointer.to_le_bytes());
    }
}
